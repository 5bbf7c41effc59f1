//! The pusher: fan-out hub for one published stream.
//!
//! One pump task owns the stream. It is the only place that touches the
//! GOP cache, so the cache needs no lock; player attachment travels
//! through the same queue as packets, which also guarantees a late joiner
//! is primed with exactly the cache contents as of its attach point and
//! receives every packet after it.
//!
//! Stopping a pusher closes its ingress channel: the pump drains whatever
//! is already buffered, exits when the queue yields `None`, and stops the
//! remaining players on the way out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::media::{RtpPacket, VideoCodec};
use crate::relay::gop::{GopCache, MAX_GOP_CACHE_LEN};
use crate::relay::player::Player;
use crate::relay::source::PusherSource;
use crate::session::SessionHandle;
use crate::transport::udp::UdpServer;

/// Work items for the pump task.
pub(crate) enum PusherEvent {
    Packet(RtpPacket),
    Attach(Arc<Player>),
    /// Forget cached packets and detector state (publisher takeover).
    ClearCache,
}

pub struct Pusher {
    path: String,
    gop_enabled: bool,
    source: RwLock<PusherSource>,
    players: RwLock<HashMap<u64, Arc<Player>>>,

    /// `None` once the pusher is stopping; taking it closes the channel.
    ingress_tx: RwLock<Option<mpsc::Sender<PusherEvent>>>,
    pump_rx: Mutex<Option<mpsc::Receiver<PusherEvent>>>,

    udp_server: tokio::sync::Mutex<Option<UdpServer>>,
}

impl Pusher {
    /// Pusher backed by a publisher session on this server. Holds only a
    /// weak handle to it; the session owns the pusher, not the reverse.
    pub fn new(session: Arc<SessionHandle>, gop_enabled: bool) -> Arc<Self> {
        Self::from_source(PusherSource::from_session(&session), gop_enabled)
    }

    /// Pusher backed by any source.
    pub fn from_source(source: PusherSource, gop_enabled: bool) -> Arc<Self> {
        // Ingress depth matches the GOP bound; a publisher outrunning the
        // pump blocks rather than ballooning memory.
        let (ingress_tx, ingress_rx) = mpsc::channel(MAX_GOP_CACHE_LEN);
        Arc::new(Self {
            path: source.path(),
            gop_enabled,
            source: RwLock::new(source),
            players: RwLock::new(HashMap::new()),
            ingress_tx: RwLock::new(Some(ingress_tx)),
            pump_rx: Mutex::new(Some(ingress_rx)),
            udp_server: tokio::sync::Mutex::new(None),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The current source's id (the publisher session id).
    pub fn id(&self) -> u64 {
        self.source.read().id()
    }

    pub fn url(&self) -> String {
        self.source.read().url()
    }

    pub fn sdp_raw(&self) -> String {
        self.source.read().sdp_raw()
    }

    pub fn audio_codec(&self) -> String {
        self.source.read().audio_codec()
    }

    pub fn video_codec(&self) -> String {
        self.source.read().video_codec()
    }

    pub fn audio_control(&self) -> String {
        self.source.read().audio_control()
    }

    pub fn video_control(&self) -> String {
        self.source.read().video_control()
    }

    pub fn is_stopped(&self) -> bool {
        self.ingress_tx.read().is_none() || self.source.read().is_stopped()
    }

    /// Whether `session_id` is still this pusher's active source. Packets
    /// and teardown from a displaced session must be ignored.
    pub fn is_source(&self, session_id: u64) -> bool {
        match &*self.source.read() {
            PusherSource::Session(session) => session
                .upgrade()
                .map_or(false, |session| session.id() == session_id),
            PusherSource::External(_) => false,
        }
    }

    fn ingress_sender(&self) -> Option<mpsc::Sender<PusherEvent>> {
        self.ingress_tx.read().clone()
    }

    /// Hand one ingress packet to the pump. Blocks when the queue is full
    /// (publisher backpressure); drops the packet if the pusher is
    /// stopping.
    pub async fn queue_rtp(&self, pack: RtpPacket) {
        let Some(tx) = self.ingress_sender() else {
            tracing::debug!(path = %self.path, "pusher stopping, dropped packet");
            return;
        };
        if tx.send(PusherEvent::Packet(pack)).await.is_err() {
            tracing::debug!(path = %self.path, "pusher stopping, dropped packet");
        }
    }

    /// Launch the pump. Called by the registry on admission; idempotent.
    pub(crate) fn spawn_pump(self: &Arc<Self>) {
        let Some(ingress_rx) = self.pump_rx.lock().take() else {
            return;
        };
        let pusher = Arc::clone(self);
        tokio::spawn(pusher.run_pump(ingress_rx));
    }

    /// The pump runs until the ingress channel closes, then drains out:
    /// everything buffered before the close is still cached and broadcast.
    async fn run_pump(self: Arc<Self>, mut ingress_rx: mpsc::Receiver<PusherEvent>) {
        let mut cache = GopCache::new(
            self.gop_enabled,
            VideoCodec::from_name(&self.video_codec()),
        );
        while let Some(event) = ingress_rx.recv().await {
            match event {
                PusherEvent::Packet(pack) => {
                    cache.observe(&pack);
                    self.broadcast(&pack);
                }
                PusherEvent::Attach(player) => self.attach(player, &cache),
                PusherEvent::ClearCache => {
                    cache.reset(VideoCodec::from_name(&self.video_codec()));
                    tracing::debug!(path = %self.path, "gop cache cleared");
                }
            }
        }
        tracing::info!(path = %self.path, "pusher pump ended");
        self.clear_players();
    }

    fn broadcast(&self, pack: &RtpPacket) {
        let players: Vec<Arc<Player>> = self.players.read().values().cloned().collect();
        for player in players {
            player.enqueue(pack.clone());
            self.source.read().add_out_bytes(pack.len() as u64);
        }
    }

    /// Pump-side attach: insert the player and prime it from the cache.
    fn attach(&self, player: Arc<Player>, cache: &GopCache) {
        let inserted = {
            let mut players = self.players.write();
            match players.entry(player.id()) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&player));
                    true
                }
            }
        };
        if !inserted {
            return;
        }
        tracing::info!(
            path = %self.path,
            player_id = player.id(),
            players = self.player_count(),
            gop_primed = cache.len(),
            "player attached"
        );
        if cache.enabled() {
            for pack in cache.packets() {
                player.enqueue(pack.clone());
                self.source.read().add_out_bytes(pack.len() as u64);
            }
        }
    }

    /// Register a subscriber. The egress worker starts immediately; the
    /// attach itself is ordered through the pump so the GOP priming lands
    /// before any packet broadcast after this call.
    pub async fn add_player(&self, player: Arc<Player>) {
        let Some(tx) = self.ingress_sender() else {
            tracing::debug!(path = %self.path, "pusher stopping, attach dropped");
            return;
        };
        player.spawn_egress();
        if tx.send(PusherEvent::Attach(player)).await.is_err() {
            tracing::debug!(path = %self.path, "pusher stopping, attach dropped");
        }
    }

    pub fn has_player(&self, player_id: u64) -> bool {
        self.players.read().contains_key(&player_id)
    }

    pub fn player_count(&self) -> usize {
        self.players.read().len()
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.read().values().cloned().collect()
    }

    /// Detach one player (its session is going away).
    pub fn remove_player(&self, player_id: u64) {
        let removed = self.players.write().remove(&player_id);
        if removed.is_some() {
            tracing::info!(
                path = %self.path,
                player_id,
                players = self.player_count(),
                "player detached"
            );
        }
    }

    /// Detach everyone. The map is swapped under the lock; the displaced
    /// players are stopped only after it is released, so a player's stop
    /// path can never deadlock against the players lock.
    pub(crate) fn clear_players(&self) {
        let displaced: Vec<Arc<Player>> = {
            let mut players = self.players.write();
            std::mem::take(&mut *players).into_values().collect()
        };
        for player in displaced {
            player.stop();
        }
    }

    /// Swap in a new publisher session, keeping the player set but
    /// clearing the GOP cache. Returns false for non-session sources.
    pub async fn rebind_session(&self, session: Arc<SessionHandle>) -> bool {
        let displaced = {
            let mut source = self.source.write();
            let old = match &*source {
                PusherSource::External(_) => {
                    tracing::warn!(
                        path = %self.path,
                        session_id = session.id(),
                        "rebind refused: pusher is not session-backed"
                    );
                    return false;
                }
                PusherSource::Session(old) => old.clone(),
            };
            *source = PusherSource::from_session(&session);
            old
        };
        if let Some(tx) = self.ingress_sender() {
            let _ = tx.send(PusherEvent::ClearCache).await;
        }
        if let Some(displaced) = displaced.upgrade() {
            displaced.request_stop();
        }
        true
    }

    /// UDP ingress setup for the audio track; returns the bound ports.
    pub(crate) async fn setup_udp_audio(&self, port_range: (u16, u16)) -> Result<(u16, u16)> {
        let Some(tx) = self.ingress_sender() else {
            return Err(Error::BadState("pusher is stopping"));
        };
        let mut guard = self.udp_server.lock().await;
        let server = guard.get_or_insert_with(UdpServer::new);
        server.setup_audio(tx, port_range).await
    }

    /// UDP ingress setup for the video track; returns the bound ports.
    pub(crate) async fn setup_udp_video(&self, port_range: (u16, u16)) -> Result<(u16, u16)> {
        let Some(tx) = self.ingress_sender() else {
            return Err(Error::BadState("pusher is stopping"));
        };
        let mut guard = self.udp_server.lock().await;
        let server = guard.get_or_insert_with(UdpServer::new);
        server.setup_video(tx, port_range).await
    }

    /// Stop the pusher: close the ingress channel and release UDP
    /// resources. The pump drains the buffered events, exits, and stops
    /// the remaining players.
    pub async fn shutdown(&self) {
        self.ingress_tx.write().take();
        // aborting the read loops drops their sender clones too
        if let Some(mut server) = self.udp_server.lock().await.take() {
            server.stop();
        }
    }
}

impl std::fmt::Debug for Pusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pusher")
            .field("path", &self.path)
            .field("id", &self.id())
            .field("players", &self.player_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
