//! Block graph construction and traversal
//!
//! Imports a byte stream into a balanced DAG of content-addressed blocks.
//! Payload bytes live in raw leaves; interior nodes are dag-pb shaped
//! protobuf messages carrying ordered links plus the number of payload bytes
//! below each link, which lets readers seek without touching every leaf.
//!
//! ```text
//!                 root (dag-pb)
//!           /         |          \
//!       node         node        leaf      <- short tail promoted
//!     / ... \      / ... \
//!  leaf ... leaf leaf ... leaf
//! ```

use cid::Cid;
use prost::Message as ProstMessage;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::car::MAX_SECTION_SIZE;
use crate::chunker::{Chunker, DEFAULT_CHUNK_SIZE};
use crate::content_id::{block_cid, CidError, DAG_PB_CODEC, RAW_CODEC};
use crate::storage::{Block, BlockStore, StorageError};

/// Default maximum number of links per interior node
pub const DEFAULT_MAX_LINKS: usize = 174;

/// Room reserved in a section for the block's CID
const SECTION_CID_ALLOWANCE: usize = 64;

/// Upper bound on the encoded bytes one link adds to an interior node:
/// the PbLink (CID, tsize, framing) plus its entry in `block_sizes`
const NODE_LINK_BOUND: usize = 64;

/// Upper bound on the encoded bytes of an interior node besides its links
const NODE_FIXED_BOUND: usize = 64;

/// Largest leaf payload that still fits in one archive section
pub const MAX_CHUNK_SIZE: usize = MAX_SECTION_SIZE as usize - SECTION_CID_ALLOWANCE;

/// Largest fan-out whose interior nodes still fit in one archive section
pub const MAX_LINKS_LIMIT: usize =
    (MAX_SECTION_SIZE as usize - SECTION_CID_ALLOWANCE - NODE_FIXED_BOUND) / NODE_LINK_BOUND;

/// Check that DAGs built with these parameters can be archived and read back
pub fn check_build_params(chunk_size: usize, max_links: usize) -> Result<(), ImportError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(ImportError::InvalidParams(format!(
            "chunk_size must be between 1 and {}, got {}",
            MAX_CHUNK_SIZE, chunk_size
        )));
    }
    if !(2..=MAX_LINKS_LIMIT).contains(&max_links) {
        return Err(ImportError::InvalidParams(format!(
            "max_links must be between 2 and {}, got {}",
            MAX_LINKS_LIMIT, max_links
        )));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid link CID: {0}")]
    InvalidLink(String),

    #[error("Malformed node: {0}")]
    Malformed(String),

    #[error("Unsupported codec 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("CID error: {0}")]
    Cid(#[from] CidError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while ingesting a stream. Blocks written before the failure
/// stay in the store.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to read input: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to store block: {0}")]
    Store(#[from] StorageError),

    #[error("Failed to build node: {0}")]
    Node(#[from] DagError),

    #[error("CID error: {0}")]
    Cid(#[from] CidError),

    #[error("Invalid build parameters: {0}")]
    InvalidParams(String),

    #[error("Block of {0} bytes does not fit in an archive section")]
    BlockTooLarge(usize),
}

/// A link from an interior node to a child block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagLink {
    pub cid: Cid,
    /// Total encoded bytes of the child's subtree
    pub tsize: u64,
    /// Payload bytes below the child
    pub file_size: u64,
}

/// Decoded interior node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    pub links: Vec<DagLink>,
    pub file_size: u64,
}

/// Encode an interior node
pub fn encode_node(node: &DagNode) -> Result<Vec<u8>, DagError> {
    let info = proto::NodeInfo {
        file_size: node.file_size,
        block_sizes: node.links.iter().map(|l| l.file_size).collect(),
    };
    let mut info_buf = Vec::new();
    info.encode(&mut info_buf)?;

    let pb_node = proto::PbNode {
        data: info_buf,
        links: node
            .links
            .iter()
            .map(|l| proto::PbLink {
                hash: l.cid.to_bytes(),
                name: String::new(),
                tsize: l.tsize,
            })
            .collect(),
    };

    let mut buf = Vec::new();
    pb_node.encode(&mut buf)?;
    Ok(buf)
}

/// Decode an interior node
pub fn decode_node(data: &[u8]) -> Result<DagNode, DagError> {
    let pb_node = proto::PbNode::decode(data)?;
    let info = proto::NodeInfo::decode(pb_node.data.as_slice())?;

    if info.block_sizes.len() != pb_node.links.len() {
        return Err(DagError::Malformed(format!(
            "{} links but {} block sizes",
            pb_node.links.len(),
            info.block_sizes.len()
        )));
    }

    let links = pb_node
        .links
        .into_iter()
        .zip(info.block_sizes)
        .map(|(link, file_size)| {
            let cid = Cid::try_from(link.hash)
                .map_err(|e| DagError::InvalidLink(e.to_string()))?;
            Ok(DagLink {
                cid,
                tsize: link.tsize,
                file_size,
            })
        })
        .collect::<Result<Vec<_>, DagError>>()?;

    Ok(DagNode {
        links,
        file_size: info.file_size,
    })
}

/// Result of a successful import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDag {
    pub root: Cid,
    pub file_size: u64,
    pub block_count: u64,
}

/// Builds balanced DAGs from byte streams
#[derive(Clone)]
pub struct DagBuilder {
    store: BlockStore,
    chunk_size: usize,
    max_links: usize,
}

impl DagBuilder {
    pub fn new(store: BlockStore) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_links: DEFAULT_MAX_LINKS,
        }
    }

    /// Leaf payload size; checked against [`MAX_CHUNK_SIZE`] on import
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Links per interior node; checked against [`MAX_LINKS_LIMIT`] on import
    pub fn with_max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links;
        self
    }

    /// Import a stream, writing every block to the store
    pub async fn import<R: AsyncRead + Unpin>(&self, reader: R) -> Result<ImportedDag, ImportError> {
        check_build_params(self.chunk_size, self.max_links)?;
        let mut chunker = Chunker::with_chunk_size(reader, self.chunk_size);
        // levels[0] collects leaves, levels[n] collects nodes of height n
        let mut levels: Vec<Vec<DagLink>> = vec![Vec::new()];
        let mut block_count = 0u64;

        while let Some(chunk) = chunker.next_chunk().await.map_err(ImportError::Read)? {
            let leaf = Block::new(chunk.to_vec())?;
            let link = DagLink {
                cid: leaf.cid,
                tsize: leaf.size() as u64,
                file_size: leaf.size() as u64,
            };
            self.store.put(leaf).await?;
            block_count += 1;
            levels[0].push(link);

            let mut height = 0;
            while levels[height].len() == self.max_links {
                let links = std::mem::take(&mut levels[height]);
                let parent = self.write_node(links).await?;
                block_count += 1;
                if levels.len() == height + 1 {
                    levels.push(Vec::new());
                }
                levels[height + 1].push(parent);
                height += 1;
            }
        }

        // Fold the partially filled levels upward; the tail of the stream
        // sits in the lowest levels so it is appended after higher siblings.
        let mut carry: Option<DagLink> = None;
        for level in levels.iter_mut() {
            let mut links = std::mem::take(level);
            links.extend(carry.take());
            carry = match links.len() {
                0 => None,
                1 => links.pop(),
                _ => {
                    block_count += 1;
                    Some(self.write_node(links).await?)
                }
            };
        }

        let (root, file_size) = match carry {
            Some(link) => (link.cid, link.file_size),
            None => {
                let empty = Block::new(Vec::new())?;
                let cid = empty.cid;
                self.store.put(empty).await?;
                block_count += 1;
                (cid, 0)
            }
        };

        info!(
            "Imported {} bytes into {} blocks, root {}",
            file_size, block_count, root
        );

        Ok(ImportedDag {
            root,
            file_size,
            block_count,
        })
    }

    async fn write_node(&self, links: Vec<DagLink>) -> Result<DagLink, ImportError> {
        let file_size = links.iter().map(|l| l.file_size).sum();
        let children_tsize: u64 = links.iter().map(|l| l.tsize).sum();
        let node = DagNode { links, file_size };

        let data = encode_node(&node)?;
        if data.len() > MAX_CHUNK_SIZE {
            return Err(ImportError::BlockTooLarge(data.len()));
        }
        let cid = block_cid(DAG_PB_CODEC, &data)?;
        let tsize = children_tsize + data.len() as u64;
        debug!("Built node {} with {} links", cid, node.links.len());

        self.store.put(Block { cid, data }).await?;
        Ok(DagLink {
            cid,
            tsize,
            file_size,
        })
    }
}

/// Payload size of the DAG rooted at `root`
pub async fn file_size(store: &BlockStore, root: &Cid) -> Result<u64, DagError> {
    let block = store.get(root).await?;
    match block.cid.codec() {
        RAW_CODEC => Ok(block.size() as u64),
        DAG_PB_CODEC => Ok(decode_node(&block.data)?.file_size),
        other => Err(DagError::UnsupportedCodec(other)),
    }
}

/// Write the payload of the DAG rooted at `root` to `writer`, returning the
/// number of bytes written
pub async fn export<W: AsyncWrite + Unpin>(
    store: &BlockStore,
    root: &Cid,
    writer: &mut W,
) -> Result<u64, DagError> {
    let mut stack = vec![*root];
    let mut written = 0u64;

    while let Some(cid) = stack.pop() {
        let block = store.get(&cid).await?;
        match cid.codec() {
            RAW_CODEC => {
                writer.write_all(&block.data).await?;
                written += block.size() as u64;
            }
            DAG_PB_CODEC => {
                let node = decode_node(&block.data)?;
                stack.extend(node.links.iter().rev().map(|l| l.cid));
            }
            other => return Err(DagError::UnsupportedCodec(other)),
        }
    }

    writer.flush().await?;
    Ok(written)
}

/// Read `len` payload bytes starting at `offset`, visiting only the
/// subtrees that overlap the requested range
pub async fn read_range(
    store: &BlockStore,
    root: &Cid,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, DagError> {
    let end = offset.saturating_add(len);
    let mut out = Vec::new();
    // (cid, payload offset of its first byte)
    let mut stack = vec![(*root, 0u64)];

    while let Some((cid, start)) = stack.pop() {
        let block = store.get(&cid).await?;
        match cid.codec() {
            RAW_CODEC => {
                let block_end = start + block.size() as u64;
                let from = offset.max(start) - start;
                let to = end.min(block_end).saturating_sub(start);
                if from < to {
                    out.extend_from_slice(&block.data[from as usize..to as usize]);
                }
            }
            DAG_PB_CODEC => {
                let node = decode_node(&block.data)?;
                let mut child_start = start;
                let mut overlapping = Vec::new();
                for link in &node.links {
                    let child_end = child_start + link.file_size;
                    if child_start < end && child_end > offset {
                        overlapping.push((link.cid, child_start));
                    }
                    child_start = child_end;
                }
                stack.extend(overlapping.into_iter().rev());
            }
            other => return Err(DagError::UnsupportedCodec(other)),
        }
    }

    Ok(out)
}

mod proto {
    use prost::Message;

    /// Link inside a dag-pb node
    #[derive(Clone, PartialEq, Message)]
    pub struct PbLink {
        #[prost(bytes, tag = "1")]
        pub hash: Vec<u8>,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(uint64, tag = "3")]
        pub tsize: u64,
    }

    /// dag-pb node
    #[derive(Clone, PartialEq, Message)]
    pub struct PbNode {
        #[prost(bytes, tag = "1")]
        pub data: Vec<u8>,
        #[prost(message, repeated, tag = "2")]
        pub links: Vec<PbLink>,
    }

    /// Payload sizes carried in the node's data field
    #[derive(Clone, PartialEq, Message)]
    pub struct NodeInfo {
        #[prost(uint64, tag = "1")]
        pub file_size: u64,
        #[prost(uint64, repeated, tag = "2")]
        pub block_sizes: Vec<u64>,
    }
}
