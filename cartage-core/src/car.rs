//! CARv1 archive encoding and decoding
//!
//! An archive is a varint-prefixed dag-cbor header naming the root CIDs,
//! followed by one section per block:
//!
//! ```text
//! varint(len(header)) | header {roots: [cid], version: 1}
//! varint(len(cid) + len(data)) | cid | data
//! varint(len(cid) + len(data)) | cid | data
//! ...
//! ```
//!
//! Blocks are emitted depth-first, parent before children, children in link
//! order, each CID once. The byte layout of an archive is therefore a pure
//! function of the root and the block store, which is what lets
//! [`CarLayout`] offsets be cached and used to serve byte ranges.

use bytes::{Bytes, BytesMut};
use cid::Cid;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::content_id::verify_cid;
use crate::dag::DagError;
use crate::storage::{Block, BlockStore, StorageError};

/// The only archive version produced and accepted
pub const CAR_VERSION: u64 = 1;

/// Upper bound on a header section
const MAX_HEADER_SIZE: u64 = 1024 * 1024;

/// Upper bound on a block section (CID plus block data)
pub const MAX_SECTION_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CarError {
    #[error("Integrity check failed for block {cid}: {reason}")]
    Integrity { cid: Cid, reason: String },

    #[error("Malformed archive: {0}")]
    Malformed(String),

    #[error("Range {start}-{end} is outside the archive ({total} bytes)")]
    RangeOutOfBounds { start: u64, end: u64, total: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Position of one block section inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub cid: Cid,
    /// Offset of the section's varint prefix
    pub offset: u64,
    /// Length of the whole section, prefix included
    pub len: u64,
    /// Length of the block payload
    pub data_len: u64,
}

impl LayoutEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Byte layout of the archive for one root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarLayout {
    pub root: Cid,
    pub header_len: u64,
    pub entries: Vec<LayoutEntry>,
    pub total_size: u64,
}

impl CarLayout {
    /// Index of the first section that ends after `offset`
    fn first_entry_after(&self, offset: u64) -> usize {
        self.entries.partition_point(|e| e.end() <= offset)
    }
}

/// Encode the varint-prefixed archive header
pub fn encode_header(roots: &[Cid]) -> Vec<u8> {
    let mut cbor = Vec::new();
    cbor_head(&mut cbor, 5, 2);
    cbor_text(&mut cbor, "roots");
    cbor_head(&mut cbor, 4, roots.len() as u64);
    for root in roots {
        // tag 42: CID link, bytes prefixed with the identity multibase 0x00
        cbor_head(&mut cbor, 6, 42);
        let bytes = root.to_bytes();
        cbor_head(&mut cbor, 2, bytes.len() as u64 + 1);
        cbor.push(0x00);
        cbor.extend_from_slice(&bytes);
    }
    cbor_text(&mut cbor, "version");
    cbor_head(&mut cbor, 0, CAR_VERSION);

    let mut out = varint(cbor.len() as u64);
    out.extend_from_slice(&cbor);
    out
}

/// Decode the dag-cbor header body (without its varint prefix)
pub fn decode_header(body: &[u8]) -> Result<Vec<Cid>, CarError> {
    let mut cursor = CborCursor { buf: body, pos: 0 };
    let entries = cursor.expect(5, "header map")?;

    let mut roots = None;
    let mut version = None;
    for _ in 0..entries {
        let key = cursor.text()?;
        match key.as_str() {
            "roots" => {
                let count = cursor.expect(4, "roots array")?;
                let mut parsed = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    if cursor.expect(6, "CID tag")? != 42 {
                        return Err(CarError::Malformed("root is not a CID link".into()));
                    }
                    let len = cursor.expect(2, "CID bytes")? as usize;
                    let bytes = cursor.take(len)?;
                    match bytes.split_first() {
                        Some((0x00, cid_bytes)) => parsed.push(
                            Cid::try_from(cid_bytes)
                                .map_err(|e| CarError::Malformed(format!("bad root CID: {}", e)))?,
                        ),
                        _ => return Err(CarError::Malformed("bad CID multibase prefix".into())),
                    }
                }
                roots = Some(parsed);
            }
            "version" => version = Some(cursor.expect(0, "version")?),
            other => {
                return Err(CarError::Malformed(format!("unexpected header key {:?}", other)))
            }
        }
    }

    match version {
        Some(CAR_VERSION) => {}
        Some(v) => return Err(CarError::Malformed(format!("unsupported version {}", v))),
        None => return Err(CarError::Malformed("missing version".into())),
    }
    match roots {
        Some(roots) if !roots.is_empty() => Ok(roots),
        _ => Err(CarError::Malformed("no roots".into())),
    }
}

/// Encode the prefix of a block section: `varint(len) | cid`
pub fn section_prefix(cid: &Cid, data_len: usize) -> Vec<u8> {
    let cid_bytes = cid.to_bytes();
    let mut prefix = varint((cid_bytes.len() + data_len) as u64);
    prefix.extend_from_slice(&cid_bytes);
    prefix
}

fn varint(n: u64) -> Vec<u8> {
    let mut buf = unsigned_varint::encode::u64_buffer();
    unsigned_varint::encode::u64(n, &mut buf).to_vec()
}

fn cbor_head(buf: &mut Vec<u8>, major: u8, value: u64) {
    let major = major << 5;
    match value {
        0..=23 => buf.push(major | value as u8),
        24..=0xff => buf.extend_from_slice(&[major | 24, value as u8]),
        0x100..=0xffff => {
            buf.push(major | 25);
            buf.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(major | 26);
            buf.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            buf.push(major | 27);
            buf.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn cbor_text(buf: &mut Vec<u8>, text: &str) {
    cbor_head(buf, 3, text.len() as u64);
    buf.extend_from_slice(text.as_bytes());
}

/// Just enough CBOR to read a CARv1 header
struct CborCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CborCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CarError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CarError::Malformed("truncated header".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn head(&mut self) -> Result<(u8, u64), CarError> {
        let initial = self.take(1)?[0];
        let major = initial >> 5;
        let value = match initial & 0x1f {
            n @ 0..=23 => n as u64,
            24 => self.take(1)?[0] as u64,
            25 => u16::from_be_bytes([self.take(1)?[0], self.take(1)?[0]]) as u64,
            26 => {
                let b = self.take(4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64
            }
            27 => {
                let mut be = [0u8; 8];
                be.copy_from_slice(self.take(8)?);
                u64::from_be_bytes(be)
            }
            other => {
                return Err(CarError::Malformed(format!(
                    "unsupported CBOR additional info {}",
                    other
                )))
            }
        };
        Ok((major, value))
    }

    fn expect(&mut self, major: u8, what: &str) -> Result<u64, CarError> {
        match self.head()? {
            (m, value) if m == major => Ok(value),
            (m, _) => Err(CarError::Malformed(format!(
                "expected {} (major type {}), found major type {}",
                what, major, m
            ))),
        }
    }

    fn text(&mut self) -> Result<String, CarError> {
        let len = self.expect(3, "text key")? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CarError::Malformed("header key is not UTF-8".into()))
    }
}

/// Depth-first, parent-first walk over a DAG, yielding each block once
pub struct DagWalker {
    store: BlockStore,
    stack: Vec<Cid>,
    seen: HashSet<Cid>,
}

impl DagWalker {
    pub fn new(store: BlockStore, root: Cid) -> Self {
        Self {
            store,
            stack: vec![root],
            seen: HashSet::new(),
        }
    }

    pub async fn next_block(&mut self) -> Result<Option<Block>, CarError> {
        while let Some(cid) = self.stack.pop() {
            if !self.seen.insert(cid) {
                continue;
            }
            let block = self.store.get(&cid).await?;
            let links = block.links()?;
            self.stack.extend(links.into_iter().rev());
            return Ok(Some(block));
        }
        Ok(None)
    }
}

/// Write the full archive for `root` to `sink`, returning the bytes written
pub async fn write_car<W: AsyncWrite + Unpin>(
    store: &BlockStore,
    root: Cid,
    sink: &mut W,
) -> Result<u64, CarError> {
    let header = encode_header(&[root]);
    sink.write_all(&header).await?;
    let mut written = header.len() as u64;

    let mut walker = DagWalker::new(store.clone(), root);
    while let Some(block) = walker.next_block().await? {
        let prefix = section_prefix(&block.cid, block.data.len());
        sink.write_all(&prefix).await?;
        sink.write_all(&block.data).await?;
        written += (prefix.len() + block.data.len()) as u64;
    }

    sink.flush().await?;
    Ok(written)
}

/// Walk the DAG without emitting bytes and record where every section lands
pub async fn compute_layout(store: &BlockStore, root: Cid) -> Result<CarLayout, CarError> {
    let header_len = encode_header(&[root]).len() as u64;
    let mut offset = header_len;
    let mut entries = Vec::new();

    let mut walker = DagWalker::new(store.clone(), root);
    while let Some(block) = walker.next_block().await? {
        let prefix_len = section_prefix(&block.cid, block.data.len()).len() as u64;
        let data_len = block.data.len() as u64;
        entries.push(LayoutEntry {
            cid: block.cid,
            offset,
            len: prefix_len + data_len,
            data_len,
        });
        offset += prefix_len + data_len;
    }

    debug!(
        "Computed layout for {}: {} blocks, {} bytes",
        root,
        entries.len(),
        offset
    );

    Ok(CarLayout {
        root,
        header_len,
        entries,
        total_size: offset,
    })
}

/// Emits the bytes `[start, end)` of an archive, one section at a time,
/// using a precomputed layout to skip straight to the first section needed
pub struct RangeEmitter {
    store: BlockStore,
    layout: Arc<CarLayout>,
    pos: u64,
    end: u64,
    next_entry: usize,
}

impl RangeEmitter {
    pub fn new(
        store: BlockStore,
        layout: Arc<CarLayout>,
        start: u64,
        end: u64,
    ) -> Result<Self, CarError> {
        if start > end || end > layout.total_size {
            return Err(CarError::RangeOutOfBounds {
                start,
                end,
                total: layout.total_size,
            });
        }
        let next_entry = layout.first_entry_after(start);
        Ok(Self {
            store,
            layout,
            pos: start,
            end,
            next_entry,
        })
    }

    /// Bytes still to be emitted
    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    /// Current absolute offset in the archive
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CarError> {
        if self.pos >= self.end {
            return Ok(None);
        }

        if self.pos < self.layout.header_len {
            let header = encode_header(&[self.layout.root]);
            if header.len() as u64 != self.layout.header_len {
                return Err(CarError::Malformed("header length changed".into()));
            }
            let to = self.end.min(self.layout.header_len);
            let chunk = Bytes::copy_from_slice(&header[self.pos as usize..to as usize]);
            self.pos = to;
            return Ok(Some(chunk));
        }

        let entry = self.layout.entries.get(self.next_entry).ok_or_else(|| {
            CarError::Malformed(format!("no section at offset {}", self.pos))
        })?;
        let block = self.store.get(&entry.cid).await?;
        if block.data.len() as u64 != entry.data_len {
            return Err(CarError::Malformed(format!(
                "block {} is {} bytes, layout says {}",
                entry.cid,
                block.data.len(),
                entry.data_len
            )));
        }

        let mut section = BytesMut::with_capacity(entry.len as usize);
        section.extend_from_slice(&section_prefix(&block.cid, block.data.len()));
        section.extend_from_slice(&block.data);
        let section = section.freeze();

        let from = (self.pos - entry.offset) as usize;
        let to = (self.end.min(entry.end()) - entry.offset) as usize;
        trace!("Emitting {} bytes of section {}", to - from, entry.cid);

        self.pos = entry.offset + to as u64;
        self.next_entry += 1;
        Ok(Some(section.slice(from..to)))
    }
}

/// Write bytes `[start, end)` of the archive described by `layout`
pub async fn write_car_range<W: AsyncWrite + Unpin>(
    store: &BlockStore,
    layout: Arc<CarLayout>,
    start: u64,
    end: u64,
    sink: &mut W,
) -> Result<u64, CarError> {
    let mut emitter = RangeEmitter::new(store.clone(), layout, start, end)?;
    let mut written = 0u64;
    while let Some(chunk) = emitter.next_chunk().await? {
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    sink.flush().await?;
    Ok(written)
}

/// Streaming archive decoder. Every block is checked against its CID
/// before it is handed out.
pub struct CarReader<R> {
    reader: R,
    roots: Vec<Cid>,
}

impl<R: AsyncRead + Unpin> CarReader<R> {
    /// Read and validate the header
    pub async fn new(mut reader: R) -> Result<Self, CarError> {
        let len = read_varint(&mut reader)
            .await?
            .ok_or_else(|| CarError::Malformed("empty archive".into()))?;
        if len == 0 || len > MAX_HEADER_SIZE {
            return Err(CarError::Malformed(format!("header length {}", len)));
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        let roots = decode_header(&body)?;

        Ok(Self { reader, roots })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Next verified block, or `None` at a clean end of archive
    pub async fn next_block(&mut self) -> Result<Option<Block>, CarError> {
        let len = match read_varint(&mut self.reader).await? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len == 0 || len > MAX_SECTION_SIZE {
            return Err(CarError::Malformed(format!("section length {}", len)));
        }

        let mut section = vec![0u8; len as usize];
        self.reader.read_exact(&mut section).await?;

        let mut cursor = io::Cursor::new(&section[..]);
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| CarError::Malformed(format!("bad section CID: {}", e)))?;
        let data = section[cursor.position() as usize..].to_vec();

        verify_cid(&data, &cid).map_err(|e| CarError::Integrity {
            cid,
            reason: e.to_string(),
        })?;

        Ok(Some(Block { cid, data }))
    }
}

/// Decode an archive into the block store, returning its roots and the
/// number of blocks read
pub async fn import_car<R: AsyncRead + Unpin>(
    reader: R,
    store: &BlockStore,
) -> Result<(Vec<Cid>, u64), CarError> {
    let mut car = CarReader::new(reader).await?;
    let mut count = 0u64;
    while let Some(block) = car.next_block().await? {
        store.put(block).await?;
        count += 1;
    }
    Ok((car.roots, count))
}

/// Read an unsigned varint; `None` on EOF before the first byte
async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>, CarError> {
    let mut buf = [0u8; 10];
    for i in 0..buf.len() {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(CarError::Malformed("truncated varint".into()));
        }
        buf[i] = byte[0];
        if byte[0] & 0x80 == 0 {
            let (value, _) = unsigned_varint::decode::u64(&buf[..=i])
                .map_err(|e| CarError::Malformed(format!("bad varint: {}", e)))?;
            return Ok(Some(value));
        }
    }
    Err(CarError::Malformed("varint too long".into()))
}
