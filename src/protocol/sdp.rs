//! SDP parsing, limited to what the relay needs (RFC 4566 subset).
//!
//! The relay never interprets media beyond keyframe detection, so only the
//! per-track `control` attribute and the `rtpmap` codec name are pulled out
//! of each `m=` block. The raw SDP body is echoed verbatim to players.

use std::collections::HashMap;

/// Per-track info extracted from an `m=` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpInfo {
    /// `a=control:` value: a bare token (`streamid=0`), a path, or a full
    /// `rtsp://` URL.
    pub control: String,
    /// Codec name from `a=rtpmap:<pt> <codec>/...`.
    pub codec: String,
}

/// Parse an SDP body into a map keyed by media kind (`"audio"` / `"video"`).
pub fn parse_sdp(body: &str) -> HashMap<String, SdpInfo> {
    let mut tracks: HashMap<String, SdpInfo> = HashMap::new();
    let mut current: Option<String> = None;

    for line in body.lines() {
        let line = line.trim_end();
        if let Some(media) = line.strip_prefix("m=") {
            let kind = media.split_whitespace().next().unwrap_or("");
            if kind == "audio" || kind == "video" {
                current = Some(kind.to_string());
                tracks.entry(kind.to_string()).or_default();
            } else {
                current = None;
            }
            continue;
        }
        let Some(kind) = &current else { continue };
        if let Some(control) = line.strip_prefix("a=control:") {
            if let Some(info) = tracks.get_mut(kind) {
                info.control = control.trim().to_string();
            }
        } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:96 H264/90000
            if let Some(codec) = rtpmap
                .split_whitespace()
                .nth(1)
                .and_then(|spec| spec.split('/').next())
            {
                if let Some(info) = tracks.get_mut(kind) {
                    info.codec = codec.to_string();
                }
            }
        }
    }
    tracks
}
