//! Media transport plumbing beyond the RTSP TCP connection.

pub mod udp;

pub use udp::{allocate_port_pair, UdpClient, UdpPair, UdpServer};
