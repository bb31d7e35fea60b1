//! Content identifiers for blocks
//!
//! Every block is addressed by a CIDv1 carrying a sha2-256 multihash of its
//! bytes. Leaf blocks use the `raw` codec, interior DAG nodes use `dag-pb`.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// sha2-256 multihash code
pub const SHA256_CODE: u64 = 0x12;

/// Codec for raw leaf blocks
pub const RAW_CODEC: u64 = 0x55;

/// Codec for interior DAG nodes
pub const DAG_PB_CODEC: u64 = 0x70;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unsupported hash function 0x{0:x}")]
    UnsupportedHash(u64),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// Compute the sha2-256 digest of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the CIDv1 of `data` under the given codec
pub fn block_cid(codec: u64, data: &[u8]) -> Result<Cid, CidError> {
    let mh = Multihash::wrap(SHA256_CODE, &sha256(data))
        .map_err(|e| CidError::Multihash(e.to_string()))?;
    Ok(Cid::new_v1(codec, mh))
}

/// CID of a raw leaf block
pub fn raw_cid(data: &[u8]) -> Result<Cid, CidError> {
    block_cid(RAW_CODEC, data)
}

/// Check that `data` hashes to `expected`, keeping the codec of `expected`
pub fn verify_cid(data: &[u8], expected: &Cid) -> Result<(), CidError> {
    let code = expected.hash().code();
    if code != SHA256_CODE {
        return Err(CidError::UnsupportedHash(code));
    }

    let computed = block_cid(expected.codec(), data)?;
    if &computed != expected {
        return Err(CidError::HashMismatch {
            expected: expected.to_string(),
            actual: computed.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from its binary form
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, CidError> {
    Cid::try_from(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))
}

/// Parse a CID from its string form
pub fn parse_cid_str(s: &str) -> Result<Cid, CidError> {
    s.parse().map_err(|e| CidError::InvalidCid(format!("{}", e)))
}
