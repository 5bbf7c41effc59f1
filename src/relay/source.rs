//! Pusher source dispatch.
//!
//! A pusher's stream can originate from an RTSP session on this server or
//! from an externally managed source (a relay pull client, a multicast
//! group). The capability surface is small and identical either way, so
//! the variants dispatch through one enum.
//!
//! The session variant holds only a *weak* handle: the session owns its
//! pusher while it is the active source, never the other way around, so a
//! pusher (or the players and pump keeping it alive) can never pin a dead
//! publisher's socket and buffers in memory. An expired handle reads as a
//! stopped source.

use std::sync::{Arc, Weak};

use crate::session::SessionHandle;

/// Capabilities an external (non-session) stream source must provide.
/// Multicast ingestion would plug in here; it is intentionally left
/// unimplemented.
pub trait StreamSource: Send + Sync {
    fn id(&self) -> u64;
    fn path(&self) -> String;
    fn url(&self) -> String;
    fn sdp_raw(&self) -> String;
    fn audio_codec(&self) -> String;
    fn video_codec(&self) -> String;
    fn audio_control(&self) -> String;
    fn video_control(&self) -> String;
    fn is_stopped(&self) -> bool;
    fn request_stop(&self);
    fn add_out_bytes(&self, n: u64);
}

/// Where a pusher's packets and stream description come from.
#[derive(Clone)]
pub enum PusherSource {
    /// A publisher session on this server (the common case). Weak by
    /// design; see the module docs.
    Session(Weak<SessionHandle>),
    /// An externally managed source.
    External(Arc<dyn StreamSource>),
}

impl PusherSource {
    /// Source for a publisher session.
    pub fn from_session(session: &Arc<SessionHandle>) -> Self {
        PusherSource::Session(Arc::downgrade(session))
    }

    fn session(&self) -> Option<Arc<SessionHandle>> {
        match self {
            PusherSource::Session(session) => session.upgrade(),
            PusherSource::External(_) => None,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            PusherSource::Session(_) => self.session().map_or(0, |s| s.id()),
            PusherSource::External(source) => source.id(),
        }
    }

    pub fn path(&self) -> String {
        match self {
            PusherSource::Session(_) => self.session().map_or_else(String::new, |s| s.path()),
            PusherSource::External(source) => source.path(),
        }
    }

    pub fn url(&self) -> String {
        match self {
            PusherSource::Session(_) => self.session().map_or_else(String::new, |s| s.url()),
            PusherSource::External(source) => source.url(),
        }
    }

    pub fn sdp_raw(&self) -> String {
        match self {
            PusherSource::Session(_) => self.session().map_or_else(String::new, |s| s.sdp_raw()),
            PusherSource::External(source) => source.sdp_raw(),
        }
    }

    pub fn audio_codec(&self) -> String {
        match self {
            PusherSource::Session(_) => {
                self.session().map_or_else(String::new, |s| s.audio_codec())
            }
            PusherSource::External(source) => source.audio_codec(),
        }
    }

    pub fn video_codec(&self) -> String {
        match self {
            PusherSource::Session(_) => {
                self.session().map_or_else(String::new, |s| s.video_codec())
            }
            PusherSource::External(source) => source.video_codec(),
        }
    }

    pub fn audio_control(&self) -> String {
        match self {
            PusherSource::Session(_) => {
                self.session().map_or_else(String::new, |s| s.media().audio_control)
            }
            PusherSource::External(source) => source.audio_control(),
        }
    }

    pub fn video_control(&self) -> String {
        match self {
            PusherSource::Session(_) => {
                self.session().map_or_else(String::new, |s| s.media().video_control)
            }
            PusherSource::External(source) => source.video_control(),
        }
    }

    /// A source whose session is gone counts as stopped.
    pub fn is_stopped(&self) -> bool {
        match self {
            PusherSource::Session(_) => self.session().map_or(true, |s| s.is_stopped()),
            PusherSource::External(source) => source.is_stopped(),
        }
    }

    pub fn request_stop(&self) {
        match self {
            PusherSource::Session(_) => {
                if let Some(session) = self.session() {
                    session.request_stop();
                }
            }
            PusherSource::External(source) => source.request_stop(),
        }
    }

    pub fn add_out_bytes(&self, n: u64) {
        match self {
            PusherSource::Session(_) => {
                if let Some(session) = self.session() {
                    session.add_out_bytes(n);
                }
            }
            PusherSource::External(source) => source.add_out_bytes(n),
        }
    }
}

impl std::fmt::Debug for PusherSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PusherSource::Session(session) => match session.upgrade() {
                Some(session) => write!(f, "PusherSource::Session({})", session.id()),
                None => f.write_str("PusherSource::Session(<gone>)"),
            },
            PusherSource::External(source) => {
                write!(f, "PusherSource::External({})", source.id())
            }
        }
    }
}
