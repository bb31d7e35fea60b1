//! Per-root archive layout cache with delayed eviction
//!
//! Computing a [`CarLayout`] walks the whole DAG, so it is done at most once
//! per root while the layout is in use. Concurrent lookups for the same cold
//! root wait on a single computation; lookups for different roots never wait
//! on each other. When the last [`LayoutRef`] for a root is dropped the entry
//! stays cached for `idle_delay`, so bursts of requests for the same root do
//! not recompute it. A single background sweep owned by the cache removes
//! idle entries.

use cid::Cid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::car::{compute_layout, CarError, CarLayout};
use crate::storage::BlockStore;

/// Default time an unreferenced layout stays cached
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(60);

/// Default period of the eviction sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LayoutCacheConfig {
    pub idle_delay: Duration,
    pub sweep_interval: Duration,
}

impl Default for LayoutCacheConfig {
    fn default() -> Self {
        Self {
            idle_delay: DEFAULT_IDLE_DELAY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Counters describing cache activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutCacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub computations: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct CacheEntry {
    layout: OnceCell<Arc<CarLayout>>,
    /// Only incremented while the index lock is held
    refs: AtomicUsize,
    idle_since: Mutex<Instant>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            layout: OnceCell::new(),
            refs: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        }
    }
}

/// Counted reference to a cache entry
struct EntryRef(Arc<CacheEntry>);

impl Drop for EntryRef {
    fn drop(&mut self) {
        // Stamped before the release so a sweep never sees zero refs with a stale time
        *self.0.idle_since.lock() = Instant::now();
        self.0.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A live handle on a cached layout
///
/// The layout stays valid for as long as the handle is held, even if the
/// entry is evicted from the index in the meantime.
pub struct LayoutRef {
    _entry: EntryRef,
    layout: Arc<CarLayout>,
}

impl LayoutRef {
    /// Shared pointer to the layout, for handing to an emitter
    pub fn layout(&self) -> Arc<CarLayout> {
        Arc::clone(&self.layout)
    }
}

impl Deref for LayoutRef {
    type Target = CarLayout;

    fn deref(&self) -> &CarLayout {
        &self.layout
    }
}

struct Inner {
    store: BlockStore,
    config: LayoutCacheConfig,
    entries: Mutex<HashMap<Cid, Arc<CacheEntry>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    lookups: AtomicU64,
    hits: AtomicU64,
    computations: AtomicU64,
    evictions: AtomicU64,
}

impl Inner {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|root, entry| {
            let idle = entry.refs.load(Ordering::Acquire) == 0
                && now.duration_since(*entry.idle_since.lock()) >= self.config.idle_delay;
            if idle {
                debug!("Evicting layout for {}", root);
            }
            !idle
        });
        let evicted = before - entries.len();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Cache of archive layouts keyed by root CID
///
/// Must be created inside a Tokio runtime; construction starts the sweep task.
#[derive(Clone)]
pub struct LayoutCache {
    inner: Arc<Inner>,
}

impl LayoutCache {
    pub fn new(store: BlockStore, config: LayoutCacheConfig) -> Self {
        let inner = Arc::new(Inner {
            store,
            config,
            entries: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        let handle = spawn_sweeper(Arc::downgrade(&inner), inner.config.sweep_interval);
        *inner.sweeper.lock() = Some(handle);

        Self { inner }
    }

    /// Get the layout for `root`, computing it if it is not cached
    pub async fn get_layout(&self, root: Cid) -> Result<LayoutRef, CarError> {
        self.inner.lookups.fetch_add(1, Ordering::Relaxed);

        let entry = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(root)
                .or_insert_with(|| Arc::new(CacheEntry::new()))
                .clone();
            entry.refs.fetch_add(1, Ordering::AcqRel);
            EntryRef(entry)
        };

        if entry.0.layout.initialized() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        }

        let inner = &self.inner;
        let layout = entry
            .0
            .layout
            .get_or_try_init(|| async {
                inner.computations.fetch_add(1, Ordering::Relaxed);
                let started = Instant::now();
                let layout = compute_layout(&inner.store, root).await?;
                info!(
                    "Layout for {} ready: {} blocks, {} bytes in {:?}",
                    root,
                    layout.entries.len(),
                    layout.total_size,
                    started.elapsed()
                );
                Ok::<_, CarError>(Arc::new(layout))
            })
            .await?
            .clone();

        Ok(LayoutRef {
            _entry: entry,
            layout,
        })
    }

    /// Run one eviction pass immediately, returning the number of entries removed
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Whether a layout for `root` is currently indexed
    pub fn contains(&self, root: &Cid) -> bool {
        self.inner
            .entries
            .lock()
            .get(root)
            .map(|e| e.layout.initialized())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> LayoutCacheStats {
        LayoutCacheStats {
            lookups: self.inner.lookups.load(Ordering::Relaxed),
            hits: self.inner.hits.load(Ordering::Relaxed),
            computations: self.inner.computations.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            entries: self.inner.entries.lock().len(),
        }
    }

    /// Stop the sweep task and drop every unreferenced entry
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
        self.inner.entries.lock().clear();
        info!("Layout cache stopped");
    }
}

fn spawn_sweeper(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let evicted = inner.sweep();
            if evicted > 0 {
                debug!("Layout sweep evicted {} entries", evicted);
            }
        }
    })
}
