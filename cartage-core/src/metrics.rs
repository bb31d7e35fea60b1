//! Prometheus metrics for the transfer node
//!
//! Thread-safe counters using atomic types

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::layout_cache::LayoutCacheStats;
use crate::registry::TransferStatus;

/// Transfer metrics shared by the server and its bindings
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Requests per binding
    http_requests: AtomicU64,
    tunnel_requests: AtomicU64,
    tunnel_streams: AtomicUsize,

    // Outcomes
    transfers_started: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_aborted: AtomicU64,
    transfers_rejected: AtomicU64,

    bytes_served: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests: AtomicU64::new(0),
                tunnel_requests: AtomicU64::new(0),
                tunnel_streams: AtomicUsize::new(0),
                transfers_started: AtomicU64::new(0),
                transfers_completed: AtomicU64::new(0),
                transfers_aborted: AtomicU64::new(0),
                transfers_rejected: AtomicU64::new(0),
                bytes_served: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Bindings

    pub fn http_request(&self) {
        self.inner.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_request(&self) {
        self.inner.tunnel_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_stream_opened(&self) {
        self.inner.tunnel_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_stream_closed(&self) {
        self.inner.tunnel_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn http_requests(&self) -> u64 {
        self.inner.http_requests.load(Ordering::Relaxed)
    }

    pub fn tunnel_requests(&self) -> u64 {
        self.inner.tunnel_requests.load(Ordering::Relaxed)
    }

    pub fn tunnel_streams(&self) -> usize {
        self.inner.tunnel_streams.load(Ordering::Relaxed)
    }

    // Transfers

    pub fn transfer_started(&self) {
        self.inner.transfers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_finished(&self, status: TransferStatus) {
        let counter = match status {
            TransferStatus::Completed => &self.inner.transfers_completed,
            TransferStatus::Aborted | TransferStatus::Failed => &self.inner.transfers_aborted,
            TransferStatus::Rejected => &self.inner.transfers_rejected,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, n: usize) {
        self.inner.bytes_served.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn transfers_started(&self) -> u64 {
        self.inner.transfers_started.load(Ordering::Relaxed)
    }

    pub fn transfers_completed(&self) -> u64 {
        self.inner.transfers_completed.load(Ordering::Relaxed)
    }

    pub fn transfers_aborted(&self) -> u64 {
        self.inner.transfers_aborted.load(Ordering::Relaxed)
    }

    pub fn transfers_rejected(&self) -> u64 {
        self.inner.transfers_rejected.load(Ordering::Relaxed)
    }

    pub fn bytes_served(&self) -> u64 {
        self.inner.bytes_served.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, cache: &LayoutCacheStats, active_transfers: usize) -> String {
        format!(
            "# HELP cartage_uptime_seconds Time since node started in seconds\n\
             # TYPE cartage_uptime_seconds counter\n\
             cartage_uptime_seconds {}\n\
             \n\
             # HELP cartage_requests_total Archive requests by binding\n\
             # TYPE cartage_requests_total counter\n\
             cartage_requests_total{{binding=\"http\"}} {}\n\
             cartage_requests_total{{binding=\"libp2p\"}} {}\n\
             \n\
             # HELP cartage_tunnel_streams Open libp2p tunnel streams\n\
             # TYPE cartage_tunnel_streams gauge\n\
             cartage_tunnel_streams {}\n\
             \n\
             # HELP cartage_active_transfers Transfers currently in the registry\n\
             # TYPE cartage_active_transfers gauge\n\
             cartage_active_transfers {}\n\
             \n\
             # HELP cartage_transfers_total Transfers by outcome\n\
             # TYPE cartage_transfers_total counter\n\
             cartage_transfers_total{{outcome=\"started\"}} {}\n\
             cartage_transfers_total{{outcome=\"completed\"}} {}\n\
             cartage_transfers_total{{outcome=\"aborted\"}} {}\n\
             cartage_transfers_total{{outcome=\"rejected\"}} {}\n\
             \n\
             # HELP cartage_bytes_served_total Archive bytes written to peers\n\
             # TYPE cartage_bytes_served_total counter\n\
             cartage_bytes_served_total {}\n\
             \n\
             # HELP cartage_layout_lookups_total Layout cache lookups\n\
             # TYPE cartage_layout_lookups_total counter\n\
             cartage_layout_lookups_total {}\n\
             \n\
             # HELP cartage_layout_hits_total Layout cache lookups served from cache\n\
             # TYPE cartage_layout_hits_total counter\n\
             cartage_layout_hits_total {}\n\
             \n\
             # HELP cartage_layout_computations_total Layouts computed from the block store\n\
             # TYPE cartage_layout_computations_total counter\n\
             cartage_layout_computations_total {}\n\
             \n\
             # HELP cartage_layout_evictions_total Idle layouts evicted\n\
             # TYPE cartage_layout_evictions_total counter\n\
             cartage_layout_evictions_total {}\n\
             \n\
             # HELP cartage_layout_entries Layouts currently cached\n\
             # TYPE cartage_layout_entries gauge\n\
             cartage_layout_entries {}\n",
            self.uptime_seconds(),
            self.http_requests(),
            self.tunnel_requests(),
            self.tunnel_streams(),
            active_transfers,
            self.transfers_started(),
            self.transfers_completed(),
            self.transfers_aborted(),
            self.transfers_rejected(),
            self.bytes_served(),
            cache.lookups,
            cache.hits,
            cache.computations,
            cache.evictions,
            cache.entries,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
