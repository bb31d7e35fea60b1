//! Archive transfer client
//!
//! Fetches an archive from a server over either binding and writes it to a
//! local file. Progress is reported as an ordered stream of
//! [`ProgressEvent`]s. When the connection drops mid-body the client asks
//! for the rest with `Range: bytes=<received>-`, at most
//! `max_resume_attempts` times; how many attempts were needed is part of
//! the [`TransferOutcome`].

use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use http_body_util::{BodyStream, Empty};
use hyper_util::rt::TokioIo;
use libp2p::Multiaddr;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::car::{CarError, CarReader};
use crate::p2p::{peer_id_from_addr, P2pNode};
use crate::registry::{TransferGuard, TransferInfo, TransferRegistry, TransferStatus};

pub const DEFAULT_MAX_RESUME_ATTEMPTS: usize = 3;

const PROGRESS_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transfer failed after {received} bytes (status {status:?}): {message}")]
    Transfer {
        status: Option<u16>,
        received: u64,
        message: String,
    },

    #[error("size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("archive failed verification: {0}")]
    Integrity(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Where an archive is served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `http(s)://host:port`
    Http(reqwest::Url),
    /// A multiaddr ending in `/p2p/<peer>`
    Libp2p(Multiaddr),
}

impl Endpoint {
    /// Parse `http://`, `https://` or `libp2p://<multiaddr>`
    pub fn parse(s: &str) -> Result<Self, FetchError> {
        if let Some(rest) = s.strip_prefix("libp2p://") {
            let rest = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            };
            let addr: Multiaddr = rest
                .parse()
                .map_err(|e| FetchError::Endpoint(format!("{}: {}", s, e)))?;
            peer_id_from_addr(&addr).map_err(|e| FetchError::Endpoint(e.to_string()))?;
            return Ok(Endpoint::Libp2p(addr));
        }

        if s.starts_with("http://") || s.starts_with("https://") {
            let url = reqwest::Url::parse(s).map_err(|e| FetchError::Endpoint(format!("{}: {}", s, e)))?;
            return Ok(Endpoint::Http(url));
        }

        Err(FetchError::Endpoint(format!(
            "{}: expected http://, https:// or libp2p://",
            s
        )))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http(url) => write!(f, "{}", url.as_str().trim_end_matches('/')),
            Endpoint::Libp2p(addr) => write!(f, "libp2p://{}", addr),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub endpoint: Endpoint,
    pub root: Cid,
    /// Full `Authorization` header value
    pub authorization: String,
    /// Archive size agreed when the transfer was authorized
    pub expected_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Extra ranged requests allowed after an interrupted body
    pub max_resume_attempts: usize,
    /// Decode the finished file and check every block against its CID
    pub verify_archive: bool,
    /// Continue from the bytes already present in the destination file
    pub resume_from_existing: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_resume_attempts: DEFAULT_MAX_RESUME_ATTEMPTS,
            verify_archive: true,
            resume_from_existing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Bytes of the archive present in the destination, including any resumed prefix
    pub bytes_received: u64,
    pub at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes_received: u64,
    /// Offset the first request started from
    pub resumed_from: u64,
    /// Requests issued, including the first
    pub attempts: usize,
    pub elapsed: Duration,
}

/// A running fetch
///
/// Yields progress events until the transfer ends; [`finish`](Self::finish)
/// returns the outcome. The event sequence is not restartable.
pub struct Transfer {
    events: mpsc::Receiver<ProgressEvent>,
    task: JoinHandle<Result<TransferOutcome, FetchError>>,
}

impl Transfer {
    /// Wait for the transfer to end, discarding unread progress events
    pub async fn finish(self) -> Result<TransferOutcome, FetchError> {
        let Transfer { events, task } = self;
        drop(events);
        task.await.map_err(|e| FetchError::Transfer {
            status: None,
            received: 0,
            message: format!("transfer task failed: {}", e),
        })?
    }

    /// Stop the transfer immediately, leaving whatever was written in place
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Stream for Transfer {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ProgressEvent>> {
        self.events.poll_recv(cx)
    }
}

/// Client for both transfer bindings
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    p2p: Option<Arc<P2pNode>>,
    registry: Option<TransferRegistry>,
    options: FetchOptions,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            p2p: None,
            registry: None,
            options: FetchOptions::default(),
        }
    }

    /// Enable `libp2p://` endpoints through `node`
    pub fn with_p2p(mut self, node: Arc<P2pNode>) -> Self {
        self.p2p = Some(node);
        self
    }

    /// Record outbound transfers in `registry`
    pub fn with_registry(mut self, registry: TransferRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Start fetching `request` into `dest`
    pub fn fetch(&self, request: TransferRequest, dest: impl Into<PathBuf>) -> Transfer {
        let (tx, events) = mpsc::channel(PROGRESS_CAPACITY);
        let transport = self.clone();
        let dest = dest.into();
        let task = tokio::spawn(async move { transport.run(request, dest, tx).await });
        Transfer { events, task }
    }

    async fn run(
        &self,
        request: TransferRequest,
        dest: PathBuf,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<TransferOutcome, FetchError> {
        let started = Instant::now();
        let guard = self.registry.as_ref().map(|registry| {
            registry.start(TransferInfo::outbound(
                request.endpoint.to_string(),
                request.root,
                request.expected_size,
            ))
        });

        let mut progress = Progress {
            events,
            guard,
            received: 0,
            reported: 0,
        };

        let result = self.run_attempts(&request, &dest, &mut progress).await;
        let received = progress.received;
        let guard = progress.guard.take();

        let result = match result {
            Ok((resumed_from, attempts)) => {
                progress.report_final().await;
                Ok(TransferOutcome {
                    path: dest,
                    bytes_received: received,
                    resumed_from,
                    attempts,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => Err(e),
        };

        match (&result, guard) {
            (Ok(outcome), Some(guard)) => {
                info!(
                    "Fetched {} ({} bytes, {} attempts) in {:?}",
                    request.root, outcome.bytes_received, outcome.attempts, outcome.elapsed
                );
                guard.finish(TransferStatus::Completed, None);
            }
            (Err(e), Some(guard)) => guard.finish(TransferStatus::Failed, Some(e.to_string())),
            _ => {}
        }
        result
    }

    async fn run_attempts(
        &self,
        request: &TransferRequest,
        dest: &Path,
        progress: &mut Progress,
    ) -> Result<(u64, usize), FetchError> {
        let mut file = open_destination(dest, self.options.resume_from_existing).await?;
        let resumed_from = file.metadata().await?.len();
        progress.received = resumed_from;
        if resumed_from > 0 {
            info!("Resuming {} from byte {}", request.root, resumed_from);
        }

        let mut attempts = 0;
        let total = loop {
            attempts += 1;
            match self.attempt(request, &mut file, progress).await {
                Ok(total) => break total,
                Err(Attempt::Retry(e)) if attempts <= self.options.max_resume_attempts => {
                    warn!(
                        "Fetch of {} interrupted at {} bytes, resuming (attempt {}): {}",
                        request.root,
                        progress.received,
                        attempts + 1,
                        e
                    );
                }
                Err(Attempt::Retry(e)) | Err(Attempt::Fatal(e)) => return Err(e),
            }
        };

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = request.expected_size {
            if expected != progress.received {
                return Err(FetchError::SizeMismatch {
                    expected,
                    received: progress.received,
                });
            }
        }
        if total != progress.received {
            return Err(FetchError::SizeMismatch {
                expected: total,
                received: progress.received,
            });
        }

        if self.options.verify_archive {
            verify_archive(dest, request.root).await?;
        }
        Ok((resumed_from, attempts))
    }

    /// One request for the bytes from `progress.received` onward. Returns the
    /// archive's total size once the body has been written in full.
    async fn attempt(
        &self,
        request: &TransferRequest,
        file: &mut File,
        progress: &mut Progress,
    ) -> Result<u64, Attempt> {
        let offset = progress.received;
        let response = match &request.endpoint {
            Endpoint::Http(url) => self.open_http(url, request, offset).await,
            Endpoint::Libp2p(addr) => self.open_libp2p(addr, request, offset).await,
        }
        .map_err(|message| {
            Attempt::Retry(FetchError::Transfer {
                status: None,
                received: offset,
                message,
            })
        })?;

        let head = &response.head;
        let fail = |message: String| FetchError::Transfer {
            status: Some(head.status),
            received: offset,
            message,
        };

        let (start, total) = match head.status {
            200 => (0, head.content_length),
            206 => {
                let (start, total) = head
                    .content_range
                    .as_deref()
                    .and_then(parse_content_range)
                    .ok_or_else(|| Attempt::Fatal(fail("bad Content-Range".into())))?;
                (start, Some(total))
            }
            416 => {
                // Nothing left to fetch when a resumed file is already complete
                let total = head
                    .content_range
                    .as_deref()
                    .and_then(|v| v.strip_prefix("bytes */"))
                    .and_then(|v| v.parse::<u64>().ok());
                return match total {
                    Some(total) if total == offset => Ok(total),
                    _ => Err(Attempt::Fatal(fail(head.message.clone()))),
                };
            }
            _ => return Err(Attempt::Fatal(fail(head.message.clone()))),
        };

        if start != offset {
            if start != 0 {
                return Err(Attempt::Fatal(fail(format!(
                    "asked for offset {}, server sent {}",
                    offset, start
                ))));
            }
            debug!("Server ignored range, restarting {} from zero", request.root);
            file.set_len(0).await.map_err(|e| Attempt::Fatal(e.into()))?;
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| Attempt::Fatal(e.into()))?;
            progress.restart();
        }
        let total = total.ok_or_else(|| Attempt::Fatal(fail("missing Content-Length".into())))?;

        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                Attempt::Retry(FetchError::Transfer {
                    status: Some(head.status),
                    received: progress.received,
                    message: e.to_string(),
                })
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Attempt::Fatal(e.into()))?;
            progress.advance(chunk.len() as u64);
        }

        if progress.received < total {
            return Err(Attempt::Retry(FetchError::Transfer {
                status: Some(head.status),
                received: progress.received,
                message: "connection closed before the archive was complete".into(),
            }));
        }
        Ok(total)
    }

    async fn open_http(
        &self,
        url: &reqwest::Url,
        request: &TransferRequest,
        offset: u64,
    ) -> Result<FetchResponse, String> {
        let target = format!("{}/{}", url.as_str().trim_end_matches('/'), request.root);
        let mut builder = self
            .http
            .get(&target)
            .header(reqwest::header::AUTHORIZATION, &request.authorization);
        if offset > 0 {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let head = ResponseHead {
            status: response.status().as_u16(),
            content_length: header(reqwest::header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_range: header(reqwest::header::CONTENT_RANGE),
            message: response.status().to_string(),
        };
        let body = response
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();
        Ok(FetchResponse { head, body })
    }

    async fn open_libp2p(
        &self,
        addr: &Multiaddr,
        request: &TransferRequest,
        offset: u64,
    ) -> Result<FetchResponse, String> {
        let node = self
            .p2p
            .as_ref()
            .ok_or_else(|| "libp2p endpoint but no p2p node configured".to_string())?;
        let peer = peer_id_from_addr(addr).map_err(|e| e.to_string())?;
        let stream = node.open_http_stream(addr).await.map_err(|e| e.to_string())?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream.compat()))
                .await
                .map_err(|e| e.to_string())?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Tunnelled connection to {} ended: {}", peer, e);
            }
        });

        let mut builder = hyper::Request::builder()
            .uri(format!("/{}", request.root))
            .header(hyper::header::HOST, peer.to_string())
            .header(hyper::header::AUTHORIZATION, &request.authorization);
        if offset > 0 {
            builder = builder.header(hyper::header::RANGE, format!("bytes={}-", offset));
        }
        let req = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| e.to_string())?;

        let response = sender.send_request(req).await.map_err(|e| e.to_string())?;
        let header = |name: hyper::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let head = ResponseHead {
            status: response.status().as_u16(),
            content_length: header(hyper::header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_range: header(hyper::header::CONTENT_RANGE),
            message: response.status().to_string(),
        };

        let body = BodyStream::new(response.into_body())
            .map_err(io::Error::other)
            .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
            .boxed();
        Ok(FetchResponse { head, body })
    }
}

enum Attempt {
    /// The connection broke; a ranged request may pick up where it stopped
    Retry(FetchError),
    Fatal(FetchError),
}

struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    content_range: Option<String>,
    message: String,
}

struct FetchResponse {
    head: ResponseHead,
    body: BoxStream<'static, Result<Bytes, io::Error>>,
}

/// Per-transfer progress bookkeeping shared by every attempt
struct Progress {
    events: mpsc::Sender<ProgressEvent>,
    guard: Option<TransferGuard>,
    received: u64,
    reported: u64,
}

impl Progress {
    fn advance(&mut self, n: u64) {
        self.received += n;
        if let Some(guard) = &self.guard {
            guard.update(self.received);
        }
        // A restarted body stays silent until it passes what was already reported
        if self.received <= self.reported {
            return;
        }
        // Intermediate events are dropped rather than stalling the download
        let event = ProgressEvent {
            bytes_received: self.received,
            at: SystemTime::now(),
        };
        if self.events.try_send(event).is_ok() {
            self.reported = self.received;
        }
    }

    /// The server ignored the range; the body starts again from zero
    fn restart(&mut self) {
        self.received = 0;
    }

    async fn report_final(&mut self) {
        if self.received <= self.reported && self.reported > 0 {
            return;
        }
        let event = ProgressEvent {
            bytes_received: self.received,
            at: SystemTime::now(),
        };
        if self.events.send(event).await.is_ok() {
            self.reported = self.received;
        }
    }
}

async fn open_destination(path: &Path, resume: bool) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if resume {
        options.append(true);
    } else {
        options.truncate(true);
    }
    options.open(path).await
}

/// Parse `bytes <start>-<end>/<total>` into `(start, total)`
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    Some((start.parse().ok()?, total.parse().ok()?))
}

/// Decode `path` as an archive rooted at `root`, checking every block
pub async fn verify_archive(path: &Path, root: Cid) -> Result<u64, FetchError> {
    let file = File::open(path).await?;
    let mut reader = CarReader::new(BufReader::new(file))
        .await
        .map_err(integrity)?;
    if reader.roots() != [root] {
        return Err(FetchError::Integrity(format!(
            "archive roots {:?}, expected {}",
            reader.roots(),
            root
        )));
    }

    let mut blocks = 0u64;
    while reader.next_block().await.map_err(integrity)?.is_some() {
        blocks += 1;
    }
    debug!("Verified {} blocks of {}", blocks, root);
    Ok(blocks)
}

fn integrity(e: CarError) -> FetchError {
    match e {
        CarError::Io(e) => FetchError::Io(e),
        other => FetchError::Integrity(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::write_car;
    use crate::dag::DagBuilder;
    use crate::storage::BlockStore;
    use tempfile::TempDir;

    #[test]
    fn test_endpoint_parse() {
        assert!(matches!(
            Endpoint::parse("http://127.0.0.1:8080").unwrap(),
            Endpoint::Http(_)
        ));
        assert!(matches!(
            Endpoint::parse("https://provider.example").unwrap(),
            Endpoint::Http(_)
        ));

        let peer = libp2p::PeerId::random();
        let with_slash = format!("libp2p:///ip4/127.0.0.1/tcp/4001/p2p/{}", peer);
        let without = format!("libp2p://ip4/127.0.0.1/tcp/4001/p2p/{}", peer);
        assert_eq!(
            Endpoint::parse(&with_slash).unwrap(),
            Endpoint::parse(&without).unwrap()
        );

        assert!(Endpoint::parse("libp2p:///ip4/127.0.0.1/tcp/4001").is_err());
        assert!(Endpoint::parse("ftp://host").is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrip() {
        let peer = libp2p::PeerId::random();
        let endpoint = Endpoint::parse(&format!("libp2p:///ip4/10.0.0.1/tcp/1/p2p/{}", peer)).unwrap();
        assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        assert_eq!(
            Endpoint::parse("http://host:9/").unwrap().to_string(),
            "http://host:9"
        );
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 100-199/1000"), Some((100, 1000)));
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("items 1-2/3"), None);
    }

    #[tokio::test]
    async fn test_verify_archive() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path().join("blocks")).unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 7) as u8).collect();
        let dag = DagBuilder::new(store.clone())
            .with_chunk_size(1000)
            .import(&data[..])
            .await
            .unwrap();

        let mut archive = Vec::new();
        write_car(&store, dag.root, &mut archive).await.unwrap();
        let path = dir.path().join("out.car");
        tokio::fs::write(&path, &archive).await.unwrap();
        assert!(verify_archive(&path, dag.root).await.unwrap() > 1);

        let other = crate::content_id::raw_cid(b"other").unwrap();
        assert!(matches!(
            verify_archive(&path, other).await,
            Err(FetchError::Integrity(_))
        ));

        let last = archive.len() - 1;
        archive[last] ^= 0xff;
        tokio::fs::write(&path, &archive).await.unwrap();
        assert!(matches!(
            verify_archive(&path, dag.root).await,
            Err(FetchError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_resume_attempts() {
        let dir = TempDir::new().unwrap();
        let registry = TransferRegistry::new();
        let transport = HttpTransport::new()
            .with_registry(registry.clone())
            .with_options(FetchOptions {
                max_resume_attempts: 1,
                ..FetchOptions::default()
            });

        // Bind then drop so the port is closed
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let request = TransferRequest {
            endpoint: Endpoint::parse(&format!("http://127.0.0.1:{}", port)).unwrap(),
            root: crate::content_id::raw_cid(b"x").unwrap(),
            authorization: crate::auth::basic_auth_header("me", "token"),
            expected_size: Some(10),
        };

        let result = transport.fetch(request, dir.path().join("out.car")).finish().await;
        assert!(matches!(
            result,
            Err(FetchError::Transfer { status: None, received: 0, .. })
        ));
        let finished = registry.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_libp2p_endpoint_requires_node() {
        let dir = TempDir::new().unwrap();
        let peer = libp2p::PeerId::random();
        let request = TransferRequest {
            endpoint: Endpoint::parse(&format!("libp2p:///ip4/127.0.0.1/tcp/1/p2p/{}", peer)).unwrap(),
            root: crate::content_id::raw_cid(b"x").unwrap(),
            authorization: crate::auth::basic_auth_header("me", "token"),
            expected_size: None,
        };
        let transport = HttpTransport::new().with_options(FetchOptions {
            max_resume_attempts: 0,
            ..FetchOptions::default()
        });
        let err = transport
            .fetch(request, dir.path().join("out.car"))
            .finish()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no p2p node"));
    }

    #[tokio::test]
    async fn test_restarted_body_never_reports_backwards() {
        let (tx, mut rx) = mpsc::channel(PROGRESS_CAPACITY);
        let mut progress = Progress {
            events: tx,
            guard: None,
            received: 0,
            reported: 0,
        };

        progress.advance(100);
        progress.advance(100);
        progress.restart();
        progress.advance(50);
        progress.advance(100);
        progress.advance(100);
        progress.report_final().await;
        drop(progress);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.bytes_received);
        }
        assert_eq!(seen, vec![100, 200, 250]);
    }
}
