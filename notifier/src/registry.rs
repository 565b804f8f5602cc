//! Parked long-poll requests indexed by watch key.
//!
//! A [`WatchRequest`] starts `Pending` and reaches exactly one terminal state.
//! Whoever performs that transition (the bus on delivery, the poll task on
//! deadline, the drop guard on disconnect) also removes the request from every
//! key it was registered under. Losing paths do nothing.
use crate::metrics_defs::{
    LONG_POLL_CANCELLED, LONG_POLL_FULFILLED, LONG_POLL_PARKED, LONG_POLL_REGISTERED,
    LONG_POLL_TIMED_OUT,
};
use crate::types::{Notification, WatchKey};
use parking_lot::{Mutex, RwLock};
use shared::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type WatchId = u64;

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

// Deadline used when `created_at + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Pending,
    Fulfilled,
    TimedOut,
    Cancelled,
}

struct Slot {
    state: WatchState,
    responder: Option<oneshot::Sender<Vec<Notification>>>,
}

pub struct WatchRequest {
    id: WatchId,
    watch_keys: HashSet<WatchKey>,
    client_side_ids: HashMap<String, i64>,
    // normalized name -> name the client sent, restored on delivery
    original_names: HashMap<String, String>,
    created_at: Instant,
    deadline: Instant,
    slot: Mutex<Slot>,
}

impl WatchRequest {
    /// Returns the request together with the receiving end of its responder.
    pub fn new(
        watch_keys: HashSet<WatchKey>,
        client_side_ids: HashMap<String, i64>,
        original_names: HashMap<String, String>,
        timeout: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<Vec<Notification>>) {
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let request = WatchRequest {
            id: NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed),
            watch_keys,
            client_side_ids,
            original_names,
            created_at,
            deadline: created_at
                .checked_add(timeout)
                .unwrap_or(created_at + FAR_FUTURE),
            slot: Mutex::new(Slot {
                state: WatchState::Pending,
                responder: Some(tx),
            }),
        };
        (Arc::new(request), rx)
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn watch_keys(&self) -> &HashSet<WatchKey> {
        &self.watch_keys
    }

    pub fn client_side_ids(&self) -> &HashMap<String, i64> {
        &self.client_side_ids
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> WatchState {
        self.slot.lock().state
    }

    /// Moves a pending request into `to`. Returns false if it was already
    /// terminal, in which case nothing is sent.
    fn transition(&self, to: WatchState, notifications: Vec<Notification>) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != WatchState::Pending {
            return false;
        }
        slot.state = to;

        // Dropping the sender for the other outcomes closes the channel
        if let Some(responder) = slot.responder.take()
            && to == WatchState::Fulfilled
        {
            let payload = notifications
                .into_iter()
                .map(|n| self.restore_original_name(n))
                .collect();
            if responder.send(payload).is_err() {
                tracing::debug!(watch_id = self.id, "client went away before delivery");
            }
        }
        true
    }

    fn restore_original_name(&self, mut notification: Notification) -> Notification {
        if let Some(original) = self.original_names.get(&notification.namespace_name) {
            notification.namespace_name = original.clone();
        }
        notification
    }
}

impl std::fmt::Debug for WatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRequest")
            .field("id", &self.id)
            .field("watch_keys", &self.watch_keys)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct Watches {
    by_key: HashMap<WatchKey, HashMap<WatchId, Arc<WatchRequest>>>,
    parked: usize,
}

#[derive(Default)]
pub struct NotificationRegistry {
    watches: RwLock<Watches>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: &Arc<WatchRequest>) {
        let mut watches = self.watches.write();
        let mut added = false;
        for key in &request.watch_keys {
            added |= watches
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(request.id, request.clone())
                .is_none();
        }
        if added {
            watches.parked += 1;
        }
        gauge!(LONG_POLL_PARKED).set(watches.parked as f64);
        counter!(LONG_POLL_REGISTERED).increment(1);
    }

    /// Removes the request from all of its keys. Safe to call more than once.
    pub fn deregister(&self, request: &WatchRequest) -> bool {
        let mut watches = self.watches.write();
        let mut removed = false;
        for key in &request.watch_keys {
            if let Some(bucket) = watches.by_key.get_mut(key) {
                removed |= bucket.remove(&request.id).is_some();
                if bucket.is_empty() {
                    watches.by_key.remove(key);
                }
            }
        }
        if removed {
            watches.parked -= 1;
        }
        gauge!(LONG_POLL_PARKED).set(watches.parked as f64);
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.watches.read().by_key.contains_key(key)
    }

    /// Copy of the requests parked under `key` at the time of the call.
    pub fn lookup(&self, key: &str) -> Vec<Arc<WatchRequest>> {
        self.watches
            .read()
            .by_key
            .get(key)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn parked_count(&self) -> usize {
        self.watches.read().parked
    }

    pub fn fulfill(&self, request: &WatchRequest, notifications: Vec<Notification>) -> bool {
        self.finish(request, WatchState::Fulfilled, notifications)
    }

    pub fn expire(&self, request: &WatchRequest) -> bool {
        self.finish(request, WatchState::TimedOut, Vec::new())
    }

    pub fn cancel(&self, request: &WatchRequest) -> bool {
        self.finish(request, WatchState::Cancelled, Vec::new())
    }

    fn finish(
        &self,
        request: &WatchRequest,
        to: WatchState,
        notifications: Vec<Notification>,
    ) -> bool {
        if !request.transition(to, notifications) {
            return false;
        }
        self.deregister(request);

        let metric = match to {
            WatchState::Fulfilled => LONG_POLL_FULFILLED,
            WatchState::TimedOut => LONG_POLL_TIMED_OUT,
            WatchState::Cancelled | WatchState::Pending => LONG_POLL_CANCELLED,
        };
        counter!(metric).increment(1);
        tracing::debug!(
            watch_id = request.id,
            state = ?to,
            keys = ?request.watch_keys,
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "long poll finished"
        );
        true
    }
}
