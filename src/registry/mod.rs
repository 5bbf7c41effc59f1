//! The path registry: the process-wide map from stream path to its pusher.
//!
//! Admission is insert-if-absent, so at most one pusher holds a path at any
//! instant. When `close_old` is configured, a duplicate publisher goes
//! through the takeover path instead: the existing pusher is atomically
//! rebound to the new session under the registry's write lock, keeping the
//! player set.
//!
//! Pusher additions and removals are mirrored onto a lifecycle channel for
//! the recording subsystem to consume.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::relay::Pusher;
use crate::session::SessionHandle;

/// Notification emitted when the set of active pushers changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PusherAdded { path: String, id: u64 },
    PusherRemoved { path: String, id: u64 },
}

/// Outcome of a takeover attempt.
pub enum AttachOutcome {
    /// The session now drives the existing pusher.
    Attached(Arc<Pusher>),
    /// A pusher holds the path but cannot be rebound (not session-backed).
    Rejected,
    /// The path is free; admission should proceed normally.
    NoPusher,
}

pub struct PusherRegistry {
    pushers: RwLock<HashMap<String, Arc<Pusher>>>,
    lifecycle_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<LifecycleEvent>>>,
    lifecycle_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
}

impl PusherRegistry {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pushers: RwLock::new(HashMap::new()),
            lifecycle_tx: parking_lot::Mutex::new(Some(tx)),
            lifecycle_rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Take the lifecycle event receiver. First caller wins; the recording
    /// subsystem holds it for the server's lifetime.
    pub fn take_lifecycle_events(&self) -> Option<mpsc::UnboundedReceiver<LifecycleEvent>> {
        self.lifecycle_rx.lock().take()
    }

    fn notify(&self, event: LifecycleEvent) {
        if let Some(tx) = self.lifecycle_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Admit a pusher: insert if the path is free and launch its pump.
    /// Returns false when another pusher already holds the path.
    pub async fn add_pusher(&self, pusher: Arc<Pusher>) -> bool {
        let added = {
            let mut pushers = self.pushers.write().await;
            match pushers.entry(pusher.path().to_string()) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&pusher));
                    true
                }
            }
        };
        if added {
            pusher.spawn_pump();
            let pushers = self.pusher_count().await;
            tracing::info!(path = pusher.path(), id = pusher.id(), pushers, "pusher started");
            self.notify(LifecycleEvent::PusherAdded {
                path: pusher.path().to_string(),
                id: pusher.id(),
            });
        }
        added
    }

    /// Takeover: rebind the path's existing pusher onto `session`. The
    /// whole swap happens under the write lock so concurrent publishers
    /// cannot both win.
    pub async fn try_attach(&self, path: &str, session: &Arc<SessionHandle>) -> AttachOutcome {
        let pushers = self.pushers.write().await;
        match pushers.get(path) {
            Some(pusher) => {
                if pusher.rebind_session(Arc::clone(session)).await {
                    tracing::info!(path, session_id = session.id(), "attached to existing pusher");
                    AttachOutcome::Attached(Arc::clone(pusher))
                } else {
                    AttachOutcome::Rejected
                }
            }
            None => AttachOutcome::NoPusher,
        }
    }

    /// Remove a pusher, but only if it is still the one holding its path.
    /// A pusher displaced earlier must not evict its successor.
    pub async fn remove_pusher(&self, pusher: &Arc<Pusher>) {
        let removed = {
            let mut pushers = self.pushers.write().await;
            match pushers.get(pusher.path()) {
                Some(existing) if Arc::ptr_eq(existing, pusher) => {
                    pushers.remove(pusher.path());
                    true
                }
                _ => false,
            }
        };
        if removed {
            let pushers = self.pusher_count().await;
            tracing::info!(path = pusher.path(), id = pusher.id(), pushers, "pusher ended");
            self.notify(LifecycleEvent::PusherRemoved {
                path: pusher.path().to_string(),
                id: pusher.id(),
            });
        }
    }

    pub async fn get(&self, path: &str) -> Option<Arc<Pusher>> {
        self.pushers.read().await.get(path).cloned()
    }

    pub async fn pusher_count(&self) -> usize {
        self.pushers.read().await.len()
    }

    pub async fn paths(&self) -> Vec<String> {
        self.pushers.read().await.keys().cloned().collect()
    }

    /// Server stop: empty the registry, shut every pusher down, and close
    /// the lifecycle channel.
    pub async fn clear(&self) {
        let drained: Vec<Arc<Pusher>> = {
            let mut pushers = self.pushers.write().await;
            std::mem::take(&mut *pushers).into_values().collect()
        };
        for pusher in drained {
            pusher.shutdown().await;
        }
        self.lifecycle_tx.lock().take();
    }
}

impl Default for PusherRegistry {
    fn default() -> Self {
        Self::new()
    }
}
