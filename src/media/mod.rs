//! Media-plane types: RTP packets and codec payload inspection.

pub mod nal;
pub mod rtp;

pub use nal::{SequenceStartDetector, VideoCodec};
pub use rtp::{ChannelKind, RtpHeader, RtpPacket};
