//! Simple RTSP relay server
//!
//! Run with: cargo run --example simple_relay [BIND_ADDR]
//!
//! ## Publishing (push a stream)
//!
//! With ffmpeg:
//!   ffmpeg -re -i input.mp4 -c copy -rtsp_transport tcp -f rtsp rtsp://localhost:8554/live/test
//!
//! ## Playing (pull the stream)
//!
//! With ffplay:
//!   ffplay -rtsp_transport tcp rtsp://localhost:8554/live/test
//!
//! With VLC:
//!   vlc rtsp://localhost:8554/live/test
//!
//! Late joiners start at the most recent keyframe thanks to the GOP cache.

use std::net::SocketAddr;

use rtsp_relay::{HookContext, LifecycleEvent, RelayHooks, RtspServer, ServerConfig};

/// Logs admissions; a real deployment would consult a web hook here.
struct LoggingHooks;

impl RelayHooks for LoggingHooks {
    fn on_publish(&self, ctx: &HookContext<'_>) -> bool {
        println!("[{}] publish {} from {}", ctx.session_id, ctx.path, ctx.peer_addr);
        true
    }

    fn on_play(&self, ctx: &HookContext<'_>) -> bool {
        println!("[{}] play {} from {}", ctx.session_id, ctx.path, ctx.peer_addr);
        true
    }

    fn on_session_close(&self, session_id: u64, peer_addr: SocketAddr) {
        println!("[{session_id}] closed ({peer_addr})");
    }
}

#[tokio::main]
async fn main() -> rtsp_relay::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtsp_relay=info".into()),
        )
        .init();

    let bind_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:8554".to_string())
        .parse()
        .expect("invalid bind address");

    let config = ServerConfig::with_addr(bind_addr).close_old(true);
    let server = RtspServer::with_hooks(config, LoggingHooks);

    // the recording subsystem would consume these
    if let Some(mut events) = server.lifecycle_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LifecycleEvent::PusherAdded { path, id } => {
                        println!("stream up: {path} (session {id})");
                    }
                    LifecycleEvent::PusherRemoved { path, id } => {
                        println!("stream down: {path} (session {id})");
                    }
                }
            }
        });
    }

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
