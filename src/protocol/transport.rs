//! Transport header handling (RFC 2326 §12.39).
//!
//! Two shapes are accepted:
//! - `RTP/AVP/TCP;unicast;interleaved=N-M` for interleaved TCP
//! - `RTP/AVP;unicast;client_port=N-M` for UDP
//!
//! For UDP pushers the server answers with the client's header plus a
//! `server_port=N-M` field spliced in directly after `client_port`,
//! leaving every other field in its original position.

use crate::error::{Error, Result};

/// Parsed client transport preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    Tcp { rtp_channel: u8, rtcp_channel: u8 },
    Udp { client_rtp: u16, client_rtcp: u16 },
}

/// Parse the client's Transport header value.
pub fn parse_transport(value: &str) -> Result<TransportSpec> {
    for field in value.split(';') {
        let field = field.trim();
        if let Some(spec) = field.strip_prefix("interleaved=") {
            let (rtp, rtcp) = parse_pair(spec)
                .ok_or_else(|| Error::InvalidTransport(value.to_string()))?;
            if rtp > u8::MAX as u16 || rtcp > u8::MAX as u16 {
                return Err(Error::InvalidTransport(value.to_string()));
            }
            return Ok(TransportSpec::Tcp {
                rtp_channel: rtp as u8,
                rtcp_channel: rtcp as u8,
            });
        }
        if let Some(spec) = field.strip_prefix("client_port=") {
            let (rtp, rtcp) = parse_pair(spec)
                .ok_or_else(|| Error::InvalidTransport(value.to_string()))?;
            return Ok(TransportSpec::Udp {
                client_rtp: rtp,
                client_rtcp: rtcp,
            });
        }
    }
    Err(Error::InvalidTransport(value.to_string()))
}

/// Parse `N-M` or bare `N` (RTCP defaults to N+1).
fn parse_pair(spec: &str) -> Option<(u16, u16)> {
    match spec.split_once('-') {
        Some((rtp, rtcp)) => {
            let rtp = rtp.trim().parse().ok()?;
            let rtcp = rtcp.trim().parse().ok()?;
            Some((rtp, rtcp))
        }
        None => {
            let rtp: u16 = spec.trim().parse().ok()?;
            Some((rtp, rtp.checked_add(1)?))
        }
    }
}

/// Splice `server_port=<rtp>-<rtcp>` into a Transport header right after
/// the `client_port` field, preserving the order of all other fields.
pub fn insert_server_ports(value: &str, rtp: u16, rtcp: u16) -> String {
    let server_port = format!("server_port={rtp}-{rtcp}");
    let mut fields: Vec<&str> = value.split(';').collect();
    match fields
        .iter()
        .position(|field| field.trim().starts_with("client_port="))
    {
        Some(idx) => fields.insert(idx + 1, &server_port),
        None => fields.push(&server_port),
    }
    fields.join(";")
}
