//! Shared per-session state.
//!
//! A [`SessionHandle`] is the part of a session that other subsystems touch:
//! the pusher reads media info from its source session, players write media
//! through their session's serialized writer, and takeover stops a session
//! it does not own. The request-handling state machine itself lives in
//! [`Session`](super::Session) and is single-task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use crate::media::{ChannelKind, RtpPacket};
use crate::protocol::codec::SessionWriter;
use crate::protocol::message::Response;
use crate::relay::{Player, Pusher};
use crate::stats::SessionStats;
use crate::transport::udp::UdpClient;

/// What this session turned out to be. Set at most once, on ANNOUNCE or
/// DESCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Unknown,
    Pusher,
    Player,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionRole::Unknown => "unknown",
            SessionRole::Pusher => "pusher",
            SessionRole::Player => "player",
        };
        f.write_str(name)
    }
}

/// Media transport negotiated in SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "TCP",
            TransportKind::Udp => "UDP",
        })
    }
}

/// Interleaved channel numbers recorded during SETUP. `None` means the
/// track was never set up on this connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelBindings {
    pub audio_media: Option<u8>,
    pub audio_control: Option<u8>,
    pub video_media: Option<u8>,
    pub video_control: Option<u8>,
}

impl ChannelBindings {
    /// Classify an incoming interleaved channel number.
    pub fn kind_for(&self, channel: u8) -> Option<ChannelKind> {
        if self.audio_media == Some(channel) {
            Some(ChannelKind::AudioMedia)
        } else if self.audio_control == Some(channel) {
            Some(ChannelKind::AudioControl)
        } else if self.video_media == Some(channel) {
            Some(ChannelKind::VideoMedia)
        } else if self.video_control == Some(channel) {
            Some(ChannelKind::VideoControl)
        } else {
            None
        }
    }

    /// Outgoing channel number for a packet kind.
    pub fn channel_for(&self, kind: ChannelKind) -> Option<u8> {
        match kind {
            ChannelKind::AudioMedia => self.audio_media,
            ChannelKind::AudioControl => self.audio_control,
            ChannelKind::VideoMedia => self.video_media,
            ChannelKind::VideoControl => self.video_control,
        }
    }
}

/// Stream description established on ANNOUNCE (pusher) or adopted from the
/// pusher on DESCRIBE (player).
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub path: String,
    pub url: String,
    pub sdp_raw: String,
    pub audio_control: String,
    pub video_control: String,
    pub audio_codec: String,
    pub video_codec: String,
}

/// Shared, thread-safe view of one session.
pub struct SessionHandle {
    id: u64,
    peer_addr: SocketAddr,
    started_at: Instant,

    writer: Mutex<SessionWriter>,
    udp_client: Mutex<Option<UdpClient>>,

    role: RwLock<SessionRole>,
    transport: RwLock<TransportKind>,
    bindings: RwLock<ChannelBindings>,
    media: RwLock<MediaInfo>,

    pusher: RwLock<Option<Arc<Pusher>>>,
    player: RwLock<Option<Arc<Player>>>,

    /// Read deadline in milliseconds; 0 disables the deadline.
    timeout_ms: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,

    stopped: AtomicBool,
    stop_requested: AtomicBool,
    stop_notify: Notify,
}

impl SessionHandle {
    pub fn new(id: u64, peer_addr: SocketAddr, writer: SessionWriter, timeout_ms: u64) -> Self {
        Self {
            id,
            peer_addr,
            started_at: Instant::now(),
            writer: Mutex::new(writer),
            udp_client: Mutex::new(None),
            role: RwLock::new(SessionRole::Unknown),
            transport: RwLock::new(TransportKind::Tcp),
            bindings: RwLock::new(ChannelBindings::default()),
            media: RwLock::new(MediaInfo::default()),
            pusher: RwLock::new(None),
            player: RwLock::new(None),
            timeout_ms: AtomicU64::new(timeout_ms),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn role(&self) -> SessionRole {
        *self.role.read()
    }

    /// Establish the role; later calls are ignored so the role is set at
    /// most once per session lifecycle.
    pub fn set_role_once(&self, role: SessionRole) {
        let mut guard = self.role.write();
        if *guard == SessionRole::Unknown {
            *guard = role;
        }
    }

    pub fn transport(&self) -> TransportKind {
        *self.transport.read()
    }

    pub fn set_transport(&self, transport: TransportKind) {
        *self.transport.write() = transport;
    }

    pub fn bindings(&self) -> ChannelBindings {
        *self.bindings.read()
    }

    pub fn bind_audio(&self, media: u8, control: u8) {
        let mut guard = self.bindings.write();
        guard.audio_media = Some(media);
        guard.audio_control = Some(control);
    }

    pub fn bind_video(&self, media: u8, control: u8) {
        let mut guard = self.bindings.write();
        guard.video_media = Some(media);
        guard.video_control = Some(control);
    }

    pub fn media(&self) -> MediaInfo {
        self.media.read().clone()
    }

    pub fn set_media(&self, info: MediaInfo) {
        *self.media.write() = info;
    }

    pub fn path(&self) -> String {
        self.media.read().path.clone()
    }

    pub fn url(&self) -> String {
        self.media.read().url.clone()
    }

    pub fn sdp_raw(&self) -> String {
        self.media.read().sdp_raw.clone()
    }

    pub fn video_codec(&self) -> String {
        self.media.read().video_codec.clone()
    }

    pub fn audio_codec(&self) -> String {
        self.media.read().audio_codec.clone()
    }

    pub fn pusher(&self) -> Option<Arc<Pusher>> {
        self.pusher.read().clone()
    }

    pub fn set_pusher(&self, pusher: Arc<Pusher>) {
        *self.pusher.write() = Some(pusher);
    }

    pub fn take_pusher(&self) -> Option<Arc<Pusher>> {
        self.pusher.write().take()
    }

    pub fn player(&self) -> Option<Arc<Player>> {
        self.player.read().clone()
    }

    pub fn set_player(&self, player: Arc<Player>) {
        *self.player.write() = Some(player);
    }

    pub fn take_player(&self) -> Option<Arc<Player>> {
        self.player.write().take()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Drop the read deadline. Players and UDP pushers stop producing
    /// regular TCP traffic, so an idle deadline would kill them.
    pub fn clear_timeout(&self) {
        self.timeout_ms.store(0, Ordering::Relaxed);
    }

    pub fn set_in_bytes(&self, total: u64) {
        self.in_bytes.store(total, Ordering::Relaxed);
    }

    pub fn add_out_bytes(&self, n: u64) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn in_bytes(&self) -> u64 {
        self.in_bytes.load(Ordering::Relaxed)
    }

    pub fn out_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flip the stopped flag; returns true exactly once.
    pub(crate) fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    /// Ask the session to stop. Safe from any task; the session's reader
    /// loop observes it and runs the teardown path.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub async fn stop_notified(&self) {
        self.stop_notify.notified().await;
    }

    /// Bind the UDP egress pair for one track, creating the client lazily.
    /// `client_rtp`/`client_rtcp` come from the Transport header.
    pub(crate) async fn setup_udp_track(
        &self,
        audio: bool,
        client_rtp: u16,
        client_rtcp: u16,
    ) -> Result<()> {
        let mut guard = self.udp_client.lock().await;
        let client = guard.get_or_insert_with(|| UdpClient::new(self.peer_addr.ip()));
        if audio {
            client.setup_audio(client_rtp, client_rtcp).await
        } else {
            client.setup_video(client_rtp, client_rtcp).await
        }
    }

    pub(crate) async fn close_udp_client(&self) {
        self.udp_client.lock().await.take();
    }

    /// Send a response over the serialized writer.
    pub async fn send_response(&self, response: &Response) -> std::io::Result<usize> {
        let mut writer = self.writer.lock().await;
        let n = writer.write_response(response).await?;
        self.add_out_bytes(n as u64);
        Ok(n)
    }

    /// Send one media packet to this session's subscriber: interleaved on
    /// the channel bound for the packet's kind, or over the UDP client pair.
    /// Packets for unbound kinds are dropped.
    pub async fn send_rtp(&self, pack: &RtpPacket) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        if self.transport() == TransportKind::Udp {
            let mut guard = self.udp_client.lock().await;
            match guard.as_mut() {
                Some(client) => {
                    let n = client.send_rtp(pack).await?;
                    self.add_out_bytes(n as u64);
                }
                None => {
                    tracing::debug!(
                        session_id = self.id,
                        "udp transport without client, dropping packet"
                    );
                }
            }
            return Ok(());
        }

        let channel = self.bindings.read().channel_for(pack.kind);
        let Some(channel) = channel else {
            tracing::debug!(
                session_id = self.id,
                kind = %pack.kind,
                "no channel bound for packet kind, dropping"
            );
            return Ok(());
        };
        let mut writer = self.writer.lock().await;
        writer.write_interleaved(channel, &pack.payload).await?;
        self.add_out_bytes(pack.payload.len() as u64 + 4);
        Ok(())
    }

    /// Best-effort flush during teardown.
    pub(crate) async fn flush_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.flush().await;
    }

    /// Point-in-time counters snapshot. Reads are eventually consistent
    /// with the owning session's writes.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            peer_addr: self.peer_addr,
            role: self.role(),
            transport: self.transport(),
            path: self.path(),
            in_bytes: self.in_bytes(),
            out_bytes: self.out_bytes(),
            duration: self.started_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("role", &self.role())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
