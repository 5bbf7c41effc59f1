//! RTSP relay server.
//!
//! A publisher ANNOUNCEs and pushes an audio/video stream to a path; any
//! number of players DESCRIBE and pull the same path. The server
//! multiplexes the publisher's RTP packets to every attached player, over
//! interleaved TCP or separate UDP port pairs, keeps a GOP cache so late
//! joiners start at a keyframe, and optionally authenticates both sides.
//!
//! # Example
//! ```no_run
//! use rtsp_relay::{RtspServer, ServerConfig};
//!
//! # async fn example() -> rtsp_relay::Result<()> {
//! let config = ServerConfig::with_addr("0.0.0.0:8554".parse().unwrap());
//! let server = RtspServer::new(config);
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await
//! # }
//! ```

pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
pub use protocol::auth::{AuthConfig, AuthScheme};
pub use registry::{LifecycleEvent, PusherRegistry};
pub use server::{HookContext, NoopHooks, RelayHooks, RtspServer, ServerConfig};
