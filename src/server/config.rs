//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::auth::AuthConfig;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Idle read deadline for publisher control connections
    /// (zero disables it)
    pub timeout: Duration,

    /// Per-connection read/write buffer size
    pub network_buffer: usize,

    /// UDP port range for publisher RTP/RTCP pairs, inclusive
    pub udp_port_range: (u16, u16),

    /// Cache the current GOP so late joiners start at a keyframe
    pub gop_cache_enable: bool,

    /// Require authentication on every non-OPTIONS request
    pub auth: Option<AuthConfig>,

    /// Takeover policy: a duplicate publisher displaces the current one
    /// instead of being rejected
    pub close_old: bool,

    /// Per-player egress queue depth (0 = unlimited)
    pub player_queue_limit: usize,

    /// Drop packets at enqueue time for paused players
    pub drop_packet_when_paused: bool,

    /// Log full request/response texts
    pub debug_log_enable: bool,

    /// How long DESCRIBE waits for a pusher to appear before 404
    pub stream_not_exist_hold: Duration,

    /// Largest accepted request body (ANNOUNCE SDP)
    pub max_request_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:554".parse().unwrap(),
            timeout: Duration::ZERO,
            network_buffer: 1048576,
            udp_port_range: (10000, 60000),
            gop_cache_enable: true,
            auth: None,
            close_old: false,
            player_queue_limit: 0,
            drop_packet_when_paused: false,
            debug_log_enable: false,
            stream_not_exist_hold: Duration::ZERO,
            max_request_body: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the idle read deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-connection buffer size
    pub fn network_buffer(mut self, bytes: usize) -> Self {
        self.network_buffer = bytes;
        self
    }

    /// Set the UDP port range for publisher media
    pub fn udp_port_range(mut self, min: u16, max: u16) -> Self {
        self.udp_port_range = (min, max);
        self
    }

    /// Disable the GOP cache
    pub fn disable_gop_cache(mut self) -> Self {
        self.gop_cache_enable = false;
        self
    }

    /// Require authentication
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Enable publisher takeover on duplicate paths
    pub fn close_old(mut self, enabled: bool) -> Self {
        self.close_old = enabled;
        self
    }

    /// Bound each player's egress queue
    pub fn player_queue_limit(mut self, limit: usize) -> Self {
        self.player_queue_limit = limit;
        self
    }

    /// Drop packets for paused players at enqueue time
    pub fn drop_packet_when_paused(mut self, enabled: bool) -> Self {
        self.drop_packet_when_paused = enabled;
        self
    }

    /// Log full request/response texts
    pub fn debug_log(mut self, enabled: bool) -> Self {
        self.debug_log_enable = enabled;
        self
    }

    /// Let DESCRIBE wait for a pusher to appear
    pub fn stream_not_exist_hold(mut self, hold: Duration) -> Self {
        self.stream_not_exist_hold = hold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::auth::AuthScheme;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 554);
        assert_eq!(config.timeout, Duration::ZERO);
        assert_eq!(config.network_buffer, 1048576);
        assert_eq!(config.udp_port_range, (10000, 60000));
        assert!(config.gop_cache_enable);
        assert!(config.auth.is_none());
        assert!(!config.close_old);
        assert_eq!(config.player_queue_limit, 0);
        assert!(!config.drop_packet_when_paused);
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:8554".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 8554);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:8554".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .timeout(Duration::from_secs(30))
            .network_buffer(64 * 1024)
            .udp_port_range(20000, 30000)
            .close_old(true)
            .player_queue_limit(128)
            .drop_packet_when_paused(true)
            .stream_not_exist_hold(Duration::from_secs(2))
            .disable_gop_cache();

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.network_buffer, 64 * 1024);
        assert_eq!(config.udp_port_range, (20000, 30000));
        assert!(config.close_old);
        assert_eq!(config.player_queue_limit, 128);
        assert!(config.drop_packet_when_paused);
        assert_eq!(config.stream_not_exist_hold, Duration::from_secs(2));
        assert!(!config.gop_cache_enable);
    }

    #[test]
    fn test_builder_auth() {
        let config = ServerConfig::default()
            .auth(AuthConfig::new(AuthScheme::Digest).publisher("cam", "secret"));
        assert!(config.auth.is_some());
    }
}
