//! RTSP wire protocol: message grammar, interleaved framing, Transport
//! header handling, SDP parsing and authentication.

pub mod auth;
pub mod codec;
pub mod message;
pub mod sdp;
pub mod transport;

pub use auth::{AuthConfig, AuthScheme, Authenticator, CredentialRole};
pub use codec::{FrameReader, FrameWriter, Incoming, SessionWriter, INTERLEAVED_MAGIC};
pub use message::{Method, Request, Response};
pub use sdp::{parse_sdp, SdpInfo};
pub use transport::{insert_server_ports, parse_transport, TransportSpec};
