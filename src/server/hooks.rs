//! Publish/play admission hooks.
//!
//! External collaborators (web-hook probes, access policies) plug in here.
//! A veto from `on_publish` or `on_play` turns into a 500 response and the
//! session is terminated; `on_session_close` fires once per session on the
//! teardown path. Recording integrations consume the registry's lifecycle
//! events instead of a hook.

use std::net::SocketAddr;

/// Request context handed to admission hooks.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    /// Full request URL.
    pub url: &'a str,
    /// Stream path extracted from the URL.
    pub path: &'a str,
}

/// Session lifecycle hooks. All methods default to allow / no-op.
pub trait RelayHooks: Send + Sync + 'static {
    /// Consulted on ANNOUNCE. Returning false rejects the publisher.
    fn on_publish(&self, _ctx: &HookContext<'_>) -> bool {
        true
    }

    /// Consulted on DESCRIBE. Returning false rejects the player.
    fn on_play(&self, _ctx: &HookContext<'_>) -> bool {
        true
    }

    /// Fired exactly once when a session tears down.
    fn on_session_close(&self, _session_id: u64, _peer_addr: SocketAddr) {}
}

/// Allows everything.
pub struct NoopHooks;

impl RelayHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_hooks_allow() {
        let hooks = NoopHooks;
        let ctx = HookContext {
            session_id: 1,
            peer_addr: "127.0.0.1:9000".parse().unwrap(),
            url: "rtsp://h/live/a",
            path: "/live/a",
        };
        assert!(hooks.on_publish(&ctx));
        assert!(hooks.on_play(&ctx));
    }
}
