//! Bookkeeping for in-flight transfers
//!
//! Every inbound request and outbound fetch registers a handle here. The
//! registry is observational: producers update it without ever waiting on
//! consumers. It also carries the cancellation signal used for coordinated
//! shutdown.

use cid::Cid;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

pub type TransferId = u64;

/// Terminal snapshots kept for inspection after a transfer ends
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Received,
    Authenticated,
    RangeResolved,
    Streaming,
    Completed,
    /// Stopped mid-stream: peer gone, write failure or cancellation
    Aborted,
    /// Refused before any bytes were sent
    Rejected,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Aborted
                | TransferStatus::Rejected
                | TransferStatus::Failed
        )
    }
}

/// What is known about a transfer when it starts
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub direction: Direction,
    pub peer: String,
    pub root: Option<Cid>,
    pub expected_size: Option<u64>,
}

impl TransferInfo {
    pub fn inbound(peer: impl Into<String>) -> Self {
        Self {
            direction: Direction::Inbound,
            peer: peer.into(),
            root: None,
            expected_size: None,
        }
    }

    pub fn outbound(peer: impl Into<String>, root: Cid, expected_size: Option<u64>) -> Self {
        Self {
            direction: Direction::Outbound,
            peer: peer.into(),
            root: Some(root),
            expected_size,
        }
    }
}

/// Point-in-time view of a transfer handle
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub direction: Direction,
    pub peer: String,
    #[serde(serialize_with = "serialize_root")]
    pub root: Option<Cid>,
    pub bytes_transferred: u64,
    pub expected_size: Option<u64>,
    pub started_at: SystemTime,
    /// Set the first time the handle enters `Streaming`
    pub streaming_since: Option<SystemTime>,
    pub status: TransferStatus,
    pub error: Option<String>,
}

fn serialize_root<S: serde::Serializer>(root: &Option<Cid>, s: S) -> Result<S::Ok, S::Error> {
    match root {
        Some(cid) => s.serialize_some(&cid.to_string()),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started(TransferSnapshot),
    Status {
        id: TransferId,
        status: TransferStatus,
    },
    Progress {
        id: TransferId,
        bytes: u64,
    },
    Finished(TransferSnapshot),
}

struct Handle {
    snapshot: TransferSnapshot,
    cancel: watch::Sender<bool>,
}

struct Inner {
    active: Mutex<HashMap<TransferId, Handle>>,
    finished: Mutex<VecDeque<TransferSnapshot>>,
    history_limit: usize,
    next_id: AtomicU64,
    events: broadcast::Sender<TransferEvent>,
    drained: Notify,
}

/// Shared registry of active transfers
#[derive(Clone)]
pub struct TransferRegistry {
    inner: Arc<Inner>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                active: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                history_limit,
                next_id: AtomicU64::new(1),
                events,
                drained: Notify::new(),
            }),
        }
    }

    /// Register a new transfer in the `Received` state
    pub fn start(&self, info: TransferInfo) -> TransferGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = watch::channel(false);
        let snapshot = TransferSnapshot {
            id,
            direction: info.direction,
            peer: info.peer,
            root: info.root,
            bytes_transferred: 0,
            expected_size: info.expected_size,
            started_at: SystemTime::now(),
            streaming_since: None,
            status: TransferStatus::Received,
            error: None,
        };

        debug!("Transfer {} started ({:?} {})", id, snapshot.direction, snapshot.peer);
        self.emit(TransferEvent::Started(snapshot.clone()));
        self.inner
            .active
            .lock()
            .insert(id, Handle { snapshot, cancel });

        TransferGuard {
            registry: self.clone(),
            id,
            cancel_rx,
            done: false,
        }
    }

    /// Record progress; counts only ever move forward
    pub fn update(&self, id: TransferId, bytes: u64) {
        let updated = {
            let mut active = self.inner.active.lock();
            match active.get_mut(&id) {
                Some(handle) if bytes > handle.snapshot.bytes_transferred => {
                    handle.snapshot.bytes_transferred = bytes;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.emit(TransferEvent::Progress { id, bytes });
        }
    }

    /// Move an active transfer to a non-terminal status
    pub fn set_status(&self, id: TransferId, status: TransferStatus) {
        debug_assert!(!status.is_terminal());
        let changed = {
            let mut active = self.inner.active.lock();
            match active.get_mut(&id) {
                Some(handle) => {
                    if status == TransferStatus::Streaming && handle.snapshot.streaming_since.is_none() {
                        handle.snapshot.streaming_since = Some(SystemTime::now());
                    }
                    handle.snapshot.status = status;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.emit(TransferEvent::Status { id, status });
        }
    }

    /// Attach a root and expected size learned after the handle started
    pub fn describe(&self, id: TransferId, root: Cid, expected_size: Option<u64>) {
        if let Some(handle) = self.inner.active.lock().get_mut(&id) {
            handle.snapshot.root = Some(root);
            handle.snapshot.expected_size = expected_size;
        }
    }

    /// Move a transfer to a terminal status and out of the active set
    pub fn finish(&self, id: TransferId, status: TransferStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        let Some(handle) = self.inner.active.lock().remove(&id) else {
            return;
        };

        let mut snapshot = handle.snapshot;
        snapshot.status = status;
        snapshot.error = error;

        match status {
            TransferStatus::Aborted | TransferStatus::Failed => warn!(
                "Transfer {} {:?} after {} bytes: {}",
                id,
                status,
                snapshot.bytes_transferred,
                snapshot.error.as_deref().unwrap_or("no reason")
            ),
            _ => debug!(
                "Transfer {} {:?} after {} bytes",
                id, status, snapshot.bytes_transferred
            ),
        }

        {
            let mut finished = self.inner.finished.lock();
            if finished.len() >= self.inner.history_limit {
                finished.pop_front();
            }
            finished.push_back(snapshot.clone());
        }

        self.emit(TransferEvent::Finished(snapshot));
        self.inner.drained.notify_waiters();
    }

    /// Snapshot of active transfers, ordered by id
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut list: Vec<_> = self
            .inner
            .active
            .lock()
            .values()
            .map(|h| h.snapshot.clone())
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    /// Recently finished transfers, oldest first
    pub fn finished(&self) -> Vec<TransferSnapshot> {
        self.inner.finished.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.inner
            .active
            .lock()
            .get(&id)
            .map(|h| h.snapshot.clone())
    }

    /// Signal cancellation to one transfer. Returns false if it is not active.
    pub fn cancel(&self, id: TransferId) -> bool {
        match self.inner.active.lock().get(&id) {
            Some(handle) => {
                handle.cancel.send_replace(true);
                info!("Cancelling transfer {}", id);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel every active transfer and wait for all of them to finish
    ///
    /// Returns false if some were still active when `timeout` elapsed.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let count = {
            let active = self.inner.active.lock();
            for handle in active.values() {
                handle.cancel.send_replace(true);
            }
            active.len()
        };
        if count > 0 {
            info!("Stopping {} active transfers", count);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.inner.active.lock().len();
            if remaining == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("{} transfers still active after stop timeout", remaining);
                return false;
            }
        }
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Owner's handle on a registered transfer
///
/// Dropping the guard without finishing marks the transfer `Aborted`, which
/// covers response bodies dropped when the peer disconnects.
pub struct TransferGuard {
    registry: TransferRegistry,
    id: TransferId,
    cancel_rx: watch::Receiver<bool>,
    done: bool,
}

impl TransferGuard {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn update(&self, bytes: u64) {
        self.registry.update(self.id, bytes);
    }

    pub fn set_status(&self, status: TransferStatus) {
        self.registry.set_status(self.id, status);
    }

    pub fn describe(&self, root: Cid, expected_size: Option<u64>) {
        self.registry.describe(self.id, root, expected_size);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the transfer has been cancelled
    pub async fn cancelled(&mut self) {
        // An error means the registry dropped the handle, which also means stop
        let _ = self.cancel_rx.wait_for(|c| *c).await;
    }

    pub fn finish(mut self, status: TransferStatus, error: Option<String>) {
        self.done = true;
        self.registry.finish(self.id, status, error);
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.done {
            let reason = if self.is_cancelled() {
                "cancelled"
            } else {
                "dropped before completion"
            };
            self.registry
                .finish(self.id, TransferStatus::Aborted, Some(reason.to_string()));
        }
    }
}
