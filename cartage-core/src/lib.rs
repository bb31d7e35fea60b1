//! Cartage Core
//!
//! Content-addressed archive import, serving and retrieval over HTTP and
//! libp2p-tunnelled HTTP.

pub mod auth;
pub mod car;
pub mod chunker;
pub mod client;
pub mod config;
pub mod content_id;
pub mod dag;
pub mod funds;
pub mod layout_cache;
pub mod metrics;
pub mod p2p;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod storage;

pub use auth::{
    basic_auth_header, generate_auth_token, parse_basic_auth, AuthError, AuthTokenDb, AuthValue,
};
pub use car::{
    compute_layout, import_car, write_car, write_car_range, CarError, CarLayout, CarReader,
    LayoutEntry, RangeEmitter,
};
pub use chunker::{Chunker, DEFAULT_CHUNK_SIZE};
pub use client::{
    verify_archive, Endpoint, FetchError, FetchOptions, HttpTransport, ProgressEvent, Transfer,
    TransferOutcome, TransferRequest,
};
pub use config::{Action, Config, ConfigError};
pub use content_id::{block_cid, parse_cid_str, raw_cid, verify_cid, CidError};
pub use dag::{DagBuilder, ImportedDag, DEFAULT_MAX_LINKS};
pub use funds::{
    authorize_transfer, conclude_transfer, AuthorizeError, FundsError, FundsGate, ReservePool,
};
pub use layout_cache::{LayoutCache, LayoutCacheConfig, LayoutCacheStats, LayoutRef};
pub use metrics::Metrics;
pub use p2p::{create_swarm, Behaviour, P2PError, P2pNode, HTTP_PROTOCOL};
pub use registry::{
    Direction, TransferEvent, TransferGuard, TransferInfo, TransferRegistry, TransferSnapshot,
    TransferStatus,
};
pub use runtime::{authorize, fetch, import_file, run_node, NodeError};
pub use server::{CarServer, ServeError, ServerConfig, CAR_CONTENT_TYPE};
pub use storage::{Block, BlockStore, BlockStoreStats, StorageError};

// Re-export Cid for external use
pub use cid::Cid;
