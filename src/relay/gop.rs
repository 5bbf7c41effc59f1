//! GOP cache: the video packets since the last sequence start.
//!
//! Late joiners are primed from this cache so playback begins at an
//! I-frame instead of garbage. The cache is owned by the pusher pump task
//! outright, so no locking is involved; attach requests travel through the
//! pump's queue and read it there.

use crate::media::{ChannelKind, RtpHeader, RtpPacket, SequenceStartDetector, VideoCodec};

/// Hard bound on cached packets. Reaching it truncates the cache, which
/// degrades late-join quality but never memory.
pub const MAX_GOP_CACHE_LEN: usize = 256;

#[derive(Debug)]
pub struct GopCache {
    enabled: bool,
    detector: SequenceStartDetector,
    packets: Vec<RtpPacket>,
}

impl GopCache {
    pub fn new(enabled: bool, codec: VideoCodec) -> Self {
        Self {
            enabled,
            detector: SequenceStartDetector::new(codec),
            packets: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Packets to prime a new subscriber with, oldest first.
    pub fn packets(&self) -> &[RtpPacket] {
        &self.packets
    }

    /// Feed one packet through the cache. Only video media is cached; a
    /// sequence start or a full cache truncates before the append.
    pub fn observe(&mut self, pack: &RtpPacket) {
        if !self.enabled || pack.kind != ChannelKind::VideoMedia {
            return;
        }
        if let Some(header) = RtpHeader::parse(&pack.payload) {
            if let Some(payload) = header.payload(&pack.payload) {
                if self.detector.check(payload) {
                    self.packets.clear();
                }
            }
        }
        if self.packets.len() >= MAX_GOP_CACHE_LEN {
            self.packets.clear();
        }
        self.packets.push(pack.clone());
    }

    /// Empty the cache and forget detector state. Used on takeover, where
    /// the new publisher's stream starts from scratch.
    pub fn reset(&mut self, codec: VideoCodec) {
        self.packets.clear();
        self.detector = SequenceStartDetector::new(codec);
    }
}
