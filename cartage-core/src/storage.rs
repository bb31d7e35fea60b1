//! RocksDB-backed block storage
//!
//! Blocks are keyed by their binary CID. Every write is verified against
//! the claimed CID, so anything read back from the store is trusted by the
//! archive codec without re-hashing.

use cid::Cid;
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::content_id::{raw_cid, verify_cid, CidError, DAG_PB_CODEC};
use crate::dag::{decode_node, DagError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(Cid),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] CidError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a raw leaf block, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, CidError> {
        let cid = raw_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        verify_cid(&data, &cid)?;
        Ok(Self { cid, data })
    }

    /// Size of the block payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Ordered child CIDs; empty for raw leaves
    pub fn links(&self) -> Result<Vec<Cid>, DagError> {
        if self.cid.codec() != DAG_PB_CODEC {
            return Ok(Vec::new());
        }
        Ok(decode_node(&self.data)?
            .links
            .into_iter()
            .map(|link| link.cid)
            .collect())
    }
}

/// Persistent block store
///
/// Cheap to clone; all clones share the same database handle. Reads need
/// no coordination, RocksDB serves them concurrently.
#[derive(Clone)]
pub struct BlockStore {
    db: Arc<DB>,
}

impl BlockStore {
    /// Open (or create) a block store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Point lookups dominate: CID -> block
        opts.optimize_for_point_lookup(256);
        opts.set_enable_pipelined_write(true);

        // Payloads are usually incompressible
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_target_file_size_base(128 * 1024 * 1024);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened block store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    /// Store a block after verifying its CID. Storing an existing block is a no-op.
    pub async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_cid(&block.data, &block.cid)?;

        let db = Arc::clone(&self.db);
        let cid = block.cid;
        let size = block.data.len();

        tokio::task::spawn_blocking(move || {
            let key = block.cid.to_bytes();
            if db.get_pinned(&key)?.is_some() {
                trace!("Block already stored: {}", block.cid);
                return Ok::<(), StorageError>(());
            }
            db.put(&key, &block.data)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??;

        debug!("Stored block {}, size: {} bytes", cid, size);
        Ok(())
    }

    /// Retrieve a block by CID
    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let data = tokio::task::spawn_blocking(move || db.get(&key))
            .await
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??
            .ok_or(StorageError::BlockNotFound(*cid))?;

        Ok(Block { cid: *cid, data })
    }

    /// Check if a block exists
    pub async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let found = tokio::task::spawn_blocking(move || db.get_pinned(&key).map(|v| v.is_some()))
            .await
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??;
        Ok(found)
    }

    /// Count blocks and payload bytes
    pub async fn stats(&self) -> Result<BlockStoreStats, StorageError> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let mut stats = BlockStoreStats::default();
            for item in db.iterator(IteratorMode::Start) {
                let (_, value) = item?;
                stats.block_count += 1;
                stats.total_size += value.len();
            }
            Ok::<_, StorageError>(stats)
        })
        .await
        .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))?
    }
}

/// Statistics about the block store
#[derive(Debug, Clone, Default)]
pub struct BlockStoreStats {
    pub block_count: usize,
    pub total_size: usize,
}
