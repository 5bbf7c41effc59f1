//! Stream relay core: pushers fan packets out to players, with a GOP
//! cache so late joiners start at a keyframe.

pub mod gop;
pub mod player;
pub mod pusher;
pub mod source;

pub use gop::{GopCache, MAX_GOP_CACHE_LEN};
pub use player::Player;
pub use pusher::Pusher;
pub use source::{PusherSource, StreamSource};
