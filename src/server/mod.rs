//! Server assembly: configuration, admission hooks and the TCP listener.

pub mod config;
pub mod hooks;
pub mod listener;

pub use config::ServerConfig;
pub use hooks::{HookContext, NoopHooks, RelayHooks};
pub use listener::RtspServer;
