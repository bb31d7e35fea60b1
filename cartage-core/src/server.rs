//! Archive transfer server
//!
//! One axum router serves archives over two bindings: plain HTTP on a TCP
//! listener, and HTTP/1.1 tunnelled over libp2p streams speaking
//! [`HTTP_PROTOCOL`](crate::p2p::HTTP_PROTOCOL). Both bindings run the same
//! handler, so authentication, range resolution and streaming behave
//! identically.
//!
//! Per request: parse the root, authenticate the Basic credentials against
//! the token store, resolve the layout and range, then stream sections in
//! layout order. A request that fails authentication never touches the
//! layout cache or the block store.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use bytes::Bytes;
use cid::Cid;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{parse_basic_auth, unix_now, AuthError, AuthTokenDb, AuthValue};
use crate::car::{CarError, RangeEmitter};
use crate::content_id::parse_cid_str;
use crate::layout_cache::{LayoutCache, LayoutRef};
use crate::metrics::Metrics;
use crate::registry::{
    TransferEvent, TransferGuard, TransferInfo, TransferRegistry, TransferSnapshot, TransferStatus,
};
use crate::storage::BlockStore;

/// Content type of archive responses
pub const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car; version=1";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long `stop` waits for active transfers to wind down
    pub stop_timeout: Duration,
    /// Tokens older than this are refused; `None` accepts any age
    pub token_ttl: Option<Duration>,
    /// Sections buffered between the emitter and the connection
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            token_ttl: None,
            channel_capacity: 8,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("range not satisfiable for archive of {total} bytes")]
    RangeNotSatisfiable { total: u64 },

    #[error("archive error: {0}")]
    Archive(#[from] CarError),

    #[error("token store error: {0}")]
    Auth(#[from] AuthError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServeError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Registry status for a request that failed with this error
    fn transfer_status(&self) -> TransferStatus {
        match self {
            ServeError::BadRequest(_)
            | ServeError::Unauthorized(_)
            | ServeError::RangeNotSatisfiable { .. } => TransferStatus::Rejected,
            _ => TransferStatus::Failed,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Serve error: {}", self);
        } else {
            debug!("Request refused: {}", self);
        }

        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        match &self {
            ServeError::Unauthorized(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"cartage\""),
                );
            }
            ServeError::RangeNotSatisfiable { total } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            _ => {}
        }
        response
    }
}

/// Which binding a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Http,
    Libp2p,
}

/// Remote end of a tunnelled request, attached per libp2p stream
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub binding: Binding,
    pub peer: String,
}

#[derive(Clone)]
struct ServerState {
    store: BlockStore,
    tokens: AuthTokenDb,
    cache: LayoutCache,
    registry: TransferRegistry,
    metrics: Metrics,
    config: Arc<ServerConfig>,
}

/// Serves archives to authorized peers
pub struct CarServer {
    state: ServerState,
    shutdown: watch::Sender<bool>,
}

impl CarServer {
    pub fn new(
        store: BlockStore,
        tokens: AuthTokenDb,
        cache: LayoutCache,
        registry: TransferRegistry,
        metrics: Metrics,
        config: ServerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: ServerState {
                store,
                tokens,
                cache,
                registry,
                metrics,
                config: Arc::new(config),
            },
            shutdown,
        }
    }

    /// The router shared by both bindings
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_endpoint))
            .route("/transfers", get(transfers_endpoint))
            .route("/:root", get(get_archive))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.state.registry
    }

    pub fn cache(&self) -> &LayoutCache {
        &self.state.cache
    }

    pub fn metrics(&self) -> &Metrics {
        &self.state.metrics
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransferEvent> {
        self.state.registry.subscribe()
    }

    /// Serve the direct binding until [`stop`](Self::stop) is called
    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), ServeError> {
        let addr = listener.local_addr()?;
        info!("HTTP transfer binding listening on {}", addr);

        let mut shutdown = self.shutdown.subscribe();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

        info!("HTTP transfer binding on {} stopped", addr);
        Ok(())
    }

    /// Serve HTTP over inbound libp2p streams until [`stop`](Self::stop) is called
    pub async fn serve_libp2p(&self, mut incoming: libp2p_stream::IncomingStreams) {
        info!("libp2p transfer binding accepting streams");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let (peer, stream) = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = incoming.next() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            debug!("Inbound HTTP stream from {}", peer);
            let router = self.router().layer(Extension(RemotePeer {
                binding: Binding::Libp2p,
                peer: peer.to_string(),
            }));
            let metrics = self.state.metrics.clone();

            tokio::spawn(async move {
                metrics.tunnel_stream_opened();
                let io = TokioIo::new(stream.compat());
                let service = TowerToHyperService::new(router);
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Tunnelled connection from {} ended: {}", peer, e);
                }
                metrics.tunnel_stream_closed();
            });
        }

        info!("libp2p transfer binding stopped");
    }

    /// Stop both bindings, cancel active transfers and shut the cache down
    ///
    /// Returns false if some transfers were still running after the stop timeout.
    pub async fn stop(&self) -> bool {
        info!("Stopping transfer server");
        self.shutdown.send_replace(true);
        let drained = self
            .state
            .registry
            .stop_all(self.state.config.stop_timeout)
            .await;
        self.state.cache.shutdown();
        drained
    }
}

async fn metrics_endpoint(State(state): State<ServerState>) -> impl IntoResponse {
    let body = state
        .metrics
        .to_prometheus(&state.cache.stats(), state.registry.list().len());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Serialize)]
struct TransfersResponse {
    active: Vec<TransferSnapshot>,
    finished: Vec<TransferSnapshot>,
}

async fn transfers_endpoint(State(state): State<ServerState>) -> Json<TransfersResponse> {
    Json(TransfersResponse {
        active: state.registry.list(),
        finished: state.registry.finished(),
    })
}

/// GET|HEAD /:root
async fn get_archive(
    State(state): State<ServerState>,
    Path(root): Path<String>,
    method: Method,
    headers: HeaderMap,
    remote: Option<Extension<RemotePeer>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let peer = match (remote, connect_info) {
        (Some(Extension(remote)), _) => remote,
        (None, Some(ConnectInfo(addr))) => RemotePeer {
            binding: Binding::Http,
            peer: addr.to_string(),
        },
        (None, None) => RemotePeer {
            binding: Binding::Http,
            peer: "unknown".to_string(),
        },
    };
    match peer.binding {
        Binding::Http => state.metrics.http_request(),
        Binding::Libp2p => state.metrics.tunnel_request(),
    }

    let guard = state.registry.start(TransferInfo::inbound(peer.peer));
    state.metrics.transfer_started();
    let id = guard.id();

    match handle_archive(&state, &root, &method, &headers, guard).await {
        Ok(response) => response,
        Err((guard, e)) => {
            let status = e.transfer_status();
            debug!("Transfer {} refused: {}", id, e);
            state.metrics.transfer_finished(status);
            guard.finish(status, Some(e.to_string()));
            e.into_response()
        }
    }
}

async fn handle_archive(
    state: &ServerState,
    root: &str,
    method: &Method,
    headers: &HeaderMap,
    guard: TransferGuard,
) -> Result<Response, (TransferGuard, ServeError)> {
    let root = match parse_cid_str(root) {
        Ok(root) => root,
        Err(e) => return Err((guard, ServeError::BadRequest(format!("invalid root: {}", e)))),
    };

    let auth = match authenticate(state, root, headers).await {
        Ok(auth) => auth,
        Err(e) => return Err((guard, e)),
    };
    guard.describe(root, Some(auth.size));
    guard.set_status(TransferStatus::Authenticated);

    let layout = match state.cache.get_layout(root).await {
        Ok(layout) => layout,
        Err(e) => return Err((guard, e.into())),
    };
    let total = layout.total_size;

    let range = match headers.get(header::RANGE) {
        Some(value) => match value
            .to_str()
            .map_err(|_| ServeError::BadRequest("non-ASCII range header".into()))
            .and_then(|v| parse_range(v, total))
        {
            Ok(range) => Some(range),
            Err(e) => return Err((guard, e)),
        },
        None => None,
    };
    let (start, end) = range.unwrap_or((0, total));
    guard.set_status(TransferStatus::RangeResolved);

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, CAR_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, end - start)
        .header(header::ACCEPT_RANGES, "bytes");
    builder = match range {
        Some(_) => builder.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end - 1, total),
        ),
        None => builder.status(StatusCode::OK),
    };

    if *method == Method::HEAD {
        let response = match builder.body(Body::empty()) {
            Ok(response) => response,
            Err(e) => return Err((guard, ServeError::Internal(e.to_string()))),
        };
        state.metrics.transfer_finished(TransferStatus::Completed);
        guard.finish(TransferStatus::Completed, None);
        return Ok(response);
    }

    let emitter = match RangeEmitter::new(state.store.clone(), layout.layout(), start, end) {
        Ok(emitter) => emitter,
        Err(e) => return Err((guard, e.into())),
    };

    info!(
        "Transfer {}: streaming {} [{}, {}) of {} bytes",
        guard.id(),
        root,
        start,
        end,
        total
    );
    guard.set_status(TransferStatus::Streaming);

    let (tx, rx) = mpsc::channel(state.config.channel_capacity);
    let response = match builder.body(Body::from_stream(rx)) {
        Ok(response) => response,
        Err(e) => return Err((guard, ServeError::Internal(e.to_string()))),
    };

    // The layout handle rides along with the emitter task
    tokio::spawn(stream_archive(
        emitter,
        layout,
        tx,
        guard,
        state.metrics.clone(),
    ));
    Ok(response)
}

async fn authenticate(
    state: &ServerState,
    root: Cid,
    headers: &HeaderMap,
) -> Result<AuthValue, ServeError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ServeError::Unauthorized("missing credentials".into()))?;
    let (id, token) = value
        .to_str()
        .ok()
        .and_then(parse_basic_auth)
        .ok_or_else(|| ServeError::Unauthorized("malformed credentials".into()))?;

    let auth = state
        .tokens
        .get(&token)
        .await?
        .ok_or_else(|| ServeError::Unauthorized("unknown token".into()))?;

    if auth.id != id {
        return Err(ServeError::Unauthorized("token issued to another peer".into()));
    }
    if auth.payload_cid != root {
        return Err(ServeError::Unauthorized(format!(
            "token does not authorize {}",
            root
        )));
    }
    if let Some(ttl) = state.config.token_ttl {
        if unix_now().saturating_sub(auth.created_at) > ttl.as_secs() {
            return Err(ServeError::Unauthorized("token expired".into()));
        }
    }
    Ok(auth)
}

/// Parse a single `bytes=` range into `[start, end)` against `total`
fn parse_range(value: &str, total: u64) -> Result<(u64, u64), ServeError> {
    let malformed = || ServeError::BadRequest(format!("malformed range: {}", value));

    let ranges = value.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
    if ranges.contains(',') {
        return Err(ServeError::BadRequest("multiple ranges are not supported".into()));
    }
    let (first, last) = ranges.split_once('-').ok_or_else(malformed)?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the last N bytes
        let n: u64 = last.parse().map_err(|_| malformed())?;
        if n == 0 {
            return Err(ServeError::RangeNotSatisfiable { total });
        }
        return Ok((total.saturating_sub(n), total));
    }

    let start: u64 = first.parse().map_err(|_| malformed())?;
    let end = if last.is_empty() {
        total
    } else {
        let last: u64 = last.parse().map_err(|_| malformed())?;
        if last < start {
            return Err(malformed());
        }
        last.saturating_add(1).min(total)
    };

    if start >= total {
        return Err(ServeError::RangeNotSatisfiable { total });
    }
    Ok((start, end))
}

enum Step {
    Cancelled,
    Chunk(Result<Option<Bytes>, CarError>),
}

async fn stream_archive(
    mut emitter: RangeEmitter,
    layout: LayoutRef,
    mut tx: mpsc::Sender<Result<Bytes, io::Error>>,
    mut guard: TransferGuard,
    metrics: Metrics,
) {
    let id = guard.id();
    let mut sent = 0u64;

    let (status, reason) = loop {
        let step = tokio::select! {
            biased;
            _ = guard.cancelled() => Step::Cancelled,
            chunk = emitter.next_chunk() => Step::Chunk(chunk),
        };

        let chunk = match step {
            Step::Cancelled => {
                let _ = tx.try_send(Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "transfer cancelled",
                )));
                break (TransferStatus::Aborted, Some("cancelled".to_string()));
            }
            Step::Chunk(Ok(Some(chunk))) => chunk,
            Step::Chunk(Ok(None)) => break (TransferStatus::Completed, None),
            Step::Chunk(Err(e)) => {
                error!("Transfer {}: archive error after {} bytes: {}", id, sent, e);
                let _ = tx.try_send(Err(io::Error::other(e.to_string())));
                break (TransferStatus::Failed, Some(e.to_string()));
            }
        };

        let len = chunk.len();
        let sent_ok = tokio::select! {
            biased;
            _ = guard.cancelled() => None,
            result = tx.send(Ok(chunk)) => Some(result.is_ok()),
        };
        match sent_ok {
            Some(true) => {
                sent += len as u64;
                guard.update(sent);
                metrics.bytes_sent(len);
            }
            Some(false) => {
                break (TransferStatus::Aborted, Some("peer disconnected".to_string()))
            }
            None => break (TransferStatus::Aborted, Some("cancelled".to_string())),
        }
    };

    // Dropping the sender before the full length was written makes hyper
    // abort the connection instead of ending the body cleanly
    drop(tx);
    drop(layout);

    match status {
        TransferStatus::Completed => info!("Transfer {} completed: {} bytes", id, sent),
        _ => warn!(
            "Transfer {} aborted after {} bytes: {}",
            id,
            sent,
            reason.as_deref().unwrap_or("unknown")
        ),
    }
    metrics.transfer_finished(status);
    guard.finish(status, reason);
}
