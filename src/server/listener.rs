//! RTSP server listener
//!
//! Handles the TCP accept loop and spawns a session per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::auth::Authenticator;
use crate::registry::{LifecycleEvent, PusherRegistry};
use crate::server::config::ServerConfig;
use crate::server::hooks::{NoopHooks, RelayHooks};
use crate::session::Session;

/// RTSP relay server
pub struct RtspServer {
    config: Arc<ServerConfig>,
    registry: Arc<PusherRegistry>,
    hooks: Arc<dyn RelayHooks>,
    auth: Option<Arc<Authenticator>>,
    next_session_id: AtomicU64,
}

impl RtspServer {
    /// Create a server that admits everyone the configuration allows.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, NoopHooks)
    }

    /// Create a server with admission hooks.
    pub fn with_hooks(config: ServerConfig, hooks: impl RelayHooks) -> Self {
        let auth = config
            .auth
            .clone()
            .map(|auth| Arc::new(Authenticator::new(auth)));
        Self {
            config: Arc::new(config),
            registry: Arc::new(PusherRegistry::new()),
            hooks: Arc::new(hooks),
            auth,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// The path registry, for embedding (stream listings, admin surfaces).
    pub fn registry(&self) -> &Arc<PusherRegistry> {
        &self.registry
    }

    /// Pusher add/remove notifications for the recording subsystem.
    /// First caller takes the receiver.
    pub fn lifecycle_events(&self) -> Option<mpsc::UnboundedReceiver<LifecycleEvent>> {
        self.registry.take_lifecycle_events()
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "rtsp server listening");
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "rtsp server listening");

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        // empty the registry; in-flight sessions observe their stop flags
        self.registry.clear().await;
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "new connection");

        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!(session_id, error = %err, "failed to set TCP_NODELAY");
        }

        let built = Session::new(
            session_id,
            socket,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.hooks),
            self.auth.clone(),
        );
        let (session, reader) = match built {
            Ok(parts) => parts,
            Err(err) => {
                tracing::debug!(session_id, error = %err, "failed to set up session");
                return;
            }
        };

        tokio::spawn(async move {
            session.run(reader).await;
            tracing::debug!(session_id, "connection closed");
        });
    }
}
