//! A player: one subscriber's egress side.
//!
//! Players receive fan-out packets on a queue drained by their own egress
//! task, which writes through the owning session. Enqueueing never blocks
//! the pusher pump: overflow beyond the configured depth drops the newest
//! packet, and a paused player either queues or drops depending on
//! configuration.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::media::RtpPacket;
use crate::session::SessionHandle;

pub struct Player {
    /// Same as the owning session's id.
    id: u64,
    path: String,
    session: Arc<SessionHandle>,

    sender: Mutex<Option<mpsc::UnboundedSender<RtpPacket>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<RtpPacket>>>,
    /// Packets currently queued; enforced against `queue_limit`.
    depth: AtomicUsize,
    queue_limit: usize,
    drop_when_paused: bool,

    paused: AtomicBool,
    stopped: AtomicBool,
    dropped: AtomicU64,
}

impl Player {
    pub fn new(
        session: Arc<SessionHandle>,
        path: String,
        queue_limit: usize,
        drop_when_paused: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: session.id(),
            path,
            session,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
            queue_limit,
            drop_when_paused,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Packets discarded by overflow, pause policy or pause skipping.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Launch the egress worker. Idempotent: only the first call finds the
    /// receiver.
    pub(crate) fn spawn_egress(self: &Arc<Self>) {
        let Some(rx) = self.receiver.lock().take() else {
            return;
        };
        let player = Arc::clone(self);
        tokio::spawn(player.egress_loop(rx));
    }

    /// Drains until the queue closes; `stop` closes it, and the stopped
    /// guard in [`enqueue`](Self::enqueue) keeps new packets out, so what
    /// is already queued still flushes to the subscriber.
    async fn egress_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RtpPacket>) {
        while let Some(pack) = rx.recv().await {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            if self.is_paused() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Err(err) = self.session.send_rtp(&pack).await {
                tracing::debug!(
                    player_id = self.id,
                    path = %self.path,
                    error = %err,
                    "player egress failed, stopping session"
                );
                self.session.request_stop();
                break;
            }
        }
        tracing::debug!(player_id = self.id, path = %self.path, "player egress ended");
    }

    /// Non-blocking enqueue with the configured overflow policy.
    pub fn enqueue(&self, pack: RtpPacket) {
        if self.is_stopped() {
            return;
        }
        if self.is_paused() && self.drop_when_paused {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.queue_limit > 0 && self.depth.load(Ordering::Relaxed) >= self.queue_limit {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let guard = self.sender.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(pack).is_ok() {
                self.depth.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Detach: no further packets are accepted, the egress worker winds
    /// down, and the owning session is asked to stop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().take();
        self.session.request_stop();
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("paused", &self.is_paused())
            .field("stopped", &self.is_stopped())
            .field("depth", &self.queue_depth())
            .finish()
    }
}
