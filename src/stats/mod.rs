//! Session statistics snapshots.

use std::net::SocketAddr;
use std::time::Duration;

use crate::session::{SessionRole, TransportKind};

/// Point-in-time view of one session's counters. Byte counts are written
/// by the owning session only; readers accept eventual consistency.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    pub role: SessionRole,
    pub transport: TransportKind,
    pub path: String,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub duration: Duration,
}

impl SessionStats {
    /// Ingress bitrate estimate in bits per second.
    pub fn in_bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.in_bytes * 8) / secs
        } else {
            0
        }
    }

    /// Egress bitrate estimate in bits per second.
    pub fn out_bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.out_bytes * 8) / secs
        } else {
            0
        }
    }
}
