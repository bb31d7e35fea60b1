//! End-to-end transfer tests
//!
//! Each test runs a provider with both bindings on loopback and fetches
//! archives through `HttpTransport`.

use cartage_core::{
    basic_auth_header, compute_layout, dag, generate_auth_token, import_car, AuthTokenDb,
    AuthValue, BlockStore, CarServer, Cid, DagBuilder, Direction, Endpoint, FetchError,
    FetchOptions, HttpTransport, LayoutCache, LayoutCacheConfig, Metrics, P2pNode,
    ServerConfig, TransferRegistry, TransferRequest, TransferStatus,
};
use futures_util::stream::StreamExt;
use libp2p::Multiaddr;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

struct Provider {
    dir: TempDir,
    store: BlockStore,
    tokens: AuthTokenDb,
    server: Arc<CarServer>,
    http_addr: SocketAddr,
    node: Arc<P2pNode>,
}

impl Provider {
    async fn start(cache_config: LayoutCacheConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path().join("blocks")).unwrap();
        let tokens = AuthTokenDb::open(dir.path().join("auth")).unwrap();
        let cache = LayoutCache::new(store.clone(), cache_config);
        let server = Arc::new(CarServer::new(
            store.clone(),
            tokens.clone(),
            cache,
            TransferRegistry::new(),
            Metrics::new(),
            ServerConfig::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = listener.local_addr().unwrap();
        let s = server.clone();
        tokio::spawn(async move { s.serve_http(listener).await });

        let node = Arc::new(P2pNode::start(loopback(), None).await.unwrap());
        let incoming = node.accept_http().unwrap();
        let s = server.clone();
        tokio::spawn(async move { s.serve_libp2p(incoming).await });

        Provider {
            dir,
            store,
            tokens,
            server,
            http_addr,
            node,
        }
    }

    /// Import `data` and return its root with the archive size
    async fn import(&self, data: &[u8]) -> (Cid, u64) {
        let imported = DagBuilder::new(self.store.clone())
            .with_chunk_size(64 * 1024)
            .import(data)
            .await
            .unwrap();
        let layout = compute_layout(&self.store, imported.root).await.unwrap();
        (imported.root, layout.total_size)
    }

    async fn authorize(&self, client: &str, root: Cid, size: u64) -> String {
        let token = generate_auth_token();
        self.tokens
            .put(&token, &AuthValue::new(client, root, root, size))
            .await
            .unwrap();
        basic_auth_header(client, &token)
    }

    fn http_endpoint(&self) -> Endpoint {
        Endpoint::parse(&format!("http://{}", self.http_addr)).unwrap()
    }

    fn tunnel_endpoint(&self) -> Endpoint {
        Endpoint::Libp2p(self.node.dial_addr().unwrap())
    }

    /// Archive bytes as produced by a local traversal
    async fn archive(&self, root: Cid) -> Vec<u8> {
        let mut out = Vec::new();
        cartage_core::write_car(&self.store, root, &mut out).await.unwrap();
        out
    }

    async fn wait_until_idle(&self) {
        for _ in 0..500 {
            if self.server.registry().list().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfers still active: {:?}", self.server.registry().list());
    }
}

fn loopback() -> Multiaddr {
    "/ip4/127.0.0.1/tcp/0".parse().unwrap()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Forwards loopback connections to `upstream`. The first connection is cut
/// after `cut_after` response bytes; later ones pass through untouched.
async fn start_severing_proxy(upstream: SocketAddr, cut_after: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut first = true;
        while let Ok((mut inbound, _)) = listener.accept().await {
            let limit = first.then_some(cut_after);
            first = false;

            tokio::spawn(async move {
                let mut outbound = TcpStream::connect(upstream).await.unwrap();
                match limit {
                    None => {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                    Some(limit) => {
                        let (mut client_read, mut client_write) = inbound.split();
                        let (mut server_read, mut server_write) = outbound.split();
                        let requests = tokio::io::copy(&mut client_read, &mut server_write);
                        let responses = async {
                            let mut limited = (&mut server_read).take(limit);
                            tokio::io::copy(&mut limited, &mut client_write).await
                        };
                        tokio::select! {
                            _ = requests => {}
                            _ = responses => {}
                        }
                        info!("Proxy severed connection after {} bytes", limit);
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_import_serve_decode_roundtrip() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    let data = random_bytes(700 * 1024 + 17, 1);
    let (root, size) = provider.import(&data).await;
    let auth = provider.authorize("client-1", root, size).await;

    let dest = provider.dir.path().join("roundtrip.car");
    let outcome = HttpTransport::new()
        .fetch(
            TransferRequest {
                endpoint: provider.http_endpoint(),
                root,
                authorization: auth,
                expected_size: Some(size),
            },
            &dest,
        )
        .finish()
        .await
        .unwrap();
    assert_eq!(outcome.bytes_received, size);
    assert_eq!(outcome.attempts, 1);

    // Decode into an empty store and rebuild the payload
    let other = TempDir::new().unwrap();
    let store = BlockStore::open(other.path().join("blocks")).unwrap();
    let file = tokio::fs::File::open(&dest).await.unwrap();
    let (roots, blocks) = import_car(file, &store).await.unwrap();
    assert_eq!(roots, vec![root]);
    assert!(blocks > 1);

    let mut payload = Vec::new();
    dag::export(&store, &root, &mut payload).await.unwrap();
    assert_eq!(payload, data);
}

#[tokio::test]
async fn test_both_bindings_serve_identical_archives_concurrently() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    let data = random_bytes(10 * 1024 * 1024, 2);
    let (root, size) = provider.import(&data).await;
    let http_auth = provider.authorize("http-client", root, size).await;
    let tunnel_auth = provider.authorize("tunnel-client", root, size).await;

    let client_node = Arc::new(P2pNode::start(loopback(), None).await.unwrap());
    let transport = HttpTransport::new().with_p2p(client_node.clone());

    let http_dest = provider.dir.path().join("http.car");
    let tunnel_dest = provider.dir.path().join("tunnel.car");

    let http = transport.fetch(
        TransferRequest {
            endpoint: provider.http_endpoint(),
            root,
            authorization: http_auth,
            expected_size: Some(size),
        },
        &http_dest,
    );
    let tunnel = transport.fetch(
        TransferRequest {
            endpoint: provider.tunnel_endpoint(),
            root,
            authorization: tunnel_auth,
            expected_size: Some(size),
        },
        &tunnel_dest,
    );

    let (http, tunnel) = tokio::join!(http.finish(), tunnel.finish());
    assert_eq!(http.unwrap().bytes_received, size);
    assert_eq!(tunnel.unwrap().bytes_received, size);

    let http_bytes = tokio::fs::read(&http_dest).await.unwrap();
    let tunnel_bytes = tokio::fs::read(&tunnel_dest).await.unwrap();
    assert_eq!(http_bytes, tunnel_bytes);
    assert_eq!(http_bytes, provider.archive(root).await);

    provider.wait_until_idle().await;
    let finished = provider.server.registry().finished();
    let inbound: Vec<_> = finished
        .iter()
        .filter(|t| t.direction == Direction::Inbound)
        .collect();
    assert_eq!(inbound.len(), 2);
    assert!(inbound.iter().all(|t| t.status == TransferStatus::Completed));
    assert!(inbound.iter().all(|t| t.bytes_transferred == size));

    // Both requests share one computed layout
    assert_eq!(provider.server.cache().stats().computations, 1);
    assert_eq!(provider.server.metrics().http_requests(), 1);
    assert_eq!(provider.server.metrics().tunnel_requests(), 1);

    client_node.shutdown().await;
}

#[tokio::test]
async fn test_unauthorized_request_is_rejected_before_layout() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    let (root, size) = provider.import(&random_bytes(100_000, 3)).await;
    provider.authorize("client-1", root, size).await;

    let dest = provider.dir.path().join("denied.car");
    let result = HttpTransport::new()
        .fetch(
            TransferRequest {
                endpoint: provider.http_endpoint(),
                root,
                authorization: basic_auth_header("client-1", "not-a-token"),
                expected_size: None,
            },
            &dest,
        )
        .finish()
        .await;

    match result {
        Err(FetchError::Transfer { status, .. }) => assert_eq!(status, Some(401)),
        other => panic!("expected 401, got {:?}", other.map(|o| o.bytes_received)),
    }
    assert_eq!(provider.server.cache().stats().lookups, 0);

    provider.wait_until_idle().await;
    let finished = provider.server.registry().finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, TransferStatus::Rejected);
    assert_eq!(finished[0].bytes_transferred, 0);
}

#[tokio::test]
async fn test_unsatisfiable_range_never_streams() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    let (root, size) = provider.import(&random_bytes(100_000, 4)).await;
    let auth = provider.authorize("client-1", root, size).await;

    // A local file longer than the archive makes the resume offset invalid
    let dest = provider.dir.path().join("overlong.car");
    tokio::fs::write(&dest, vec![0u8; size as usize + 10])
        .await
        .unwrap();

    let result = HttpTransport::new()
        .with_options(FetchOptions {
            resume_from_existing: true,
            ..FetchOptions::default()
        })
        .fetch(
            TransferRequest {
                endpoint: provider.http_endpoint(),
                root,
                authorization: auth,
                expected_size: Some(size),
            },
            &dest,
        )
        .finish()
        .await;

    match result {
        Err(FetchError::Transfer { status, .. }) => assert_eq!(status, Some(416)),
        other => panic!("expected 416, got {:?}", other.map(|o| o.bytes_received)),
    }

    provider.wait_until_idle().await;
    let finished = provider.server.registry().finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, TransferStatus::Rejected);
    assert!(finished[0].streaming_since.is_none());
    assert_eq!(provider.server.metrics().bytes_served(), 0);
}

#[tokio::test]
async fn test_resume_of_complete_file_is_a_noop() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    let (root, size) = provider.import(&random_bytes(200_000, 5)).await;
    let auth = provider.authorize("client-1", root, size).await;

    let dest = provider.dir.path().join("complete.car");
    tokio::fs::write(&dest, provider.archive(root).await)
        .await
        .unwrap();

    let outcome = HttpTransport::new()
        .with_options(FetchOptions {
            resume_from_existing: true,
            ..FetchOptions::default()
        })
        .fetch(
            TransferRequest {
                endpoint: provider.http_endpoint(),
                root,
                authorization: auth,
                expected_size: Some(size),
            },
            &dest,
        )
        .finish()
        .await
        .unwrap();

    assert_eq!(outcome.resumed_from, size);
    assert_eq!(outcome.bytes_received, size);
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_severed_connection_resumes_with_range() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    // Large enough that loopback socket buffers cannot absorb the rest of
    // the body once the proxy stops reading
    let data = random_bytes(32 * 1024 * 1024, 6);
    let (root, size) = provider.import(&data).await;
    let auth = provider.authorize("client-1", root, size).await;

    let proxy = start_severing_proxy(provider.http_addr, size / 2).await;
    let registry = TransferRegistry::new();
    let dest = provider.dir.path().join("severed.car");

    let mut transfer = HttpTransport::new().with_registry(registry.clone()).fetch(
        TransferRequest {
            endpoint: Endpoint::parse(&format!("http://{}", proxy)).unwrap(),
            root,
            authorization: auth,
            expected_size: Some(size),
        },
        &dest,
    );

    let mut last = 0;
    while let Some(event) = transfer.next().await {
        assert!(event.bytes_received > last, "progress must strictly increase");
        last = event.bytes_received;
    }
    let outcome = transfer.finish().await.unwrap();

    assert_eq!(last, size);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.bytes_received, size);
    assert_eq!(
        tokio::fs::read(&dest).await.unwrap(),
        provider.archive(root).await
    );

    let outbound = registry.finished();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].direction, Direction::Outbound);
    assert_eq!(outbound[0].status, TransferStatus::Completed);

    // The cut request ends Aborted, the ranged retry ends Completed
    provider.wait_until_idle().await;
    let inbound: Vec<_> = provider
        .server
        .registry()
        .finished()
        .into_iter()
        .filter(|t| t.direction == Direction::Inbound)
        .collect();
    assert_eq!(inbound.len(), 2, "unexpected handles: {:?}", inbound);

    let aborted: Vec<_> = inbound
        .iter()
        .filter(|t| t.status == TransferStatus::Aborted)
        .collect();
    assert_eq!(aborted.len(), 1, "unexpected handles: {:?}", inbound);
    assert!(aborted[0].bytes_transferred > 0);
    assert!(aborted[0].bytes_transferred < size);
    assert!(aborted[0].streaming_since.is_some());

    let completed: Vec<_> = inbound
        .iter()
        .filter(|t| t.status == TransferStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 1, "unexpected handles: {:?}", inbound);
    assert!(completed[0].bytes_transferred < size);
    assert_eq!(provider.server.metrics().transfers_aborted(), 1);
}

#[tokio::test]
async fn test_idle_layout_is_evicted_and_recomputed() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig {
        idle_delay: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(25),
    })
    .await;
    let (root, size) = provider.import(&random_bytes(300_000, 7)).await;
    let auth = provider.authorize("client-1", root, size).await;

    let fetch_once = |name: &'static str| {
        let request = TransferRequest {
            endpoint: provider.http_endpoint(),
            root,
            authorization: auth.clone(),
            expected_size: Some(size),
        };
        let dest = provider.dir.path().join(name);
        async move { HttpTransport::new().fetch(request, dest).finish().await }
    };

    fetch_once("first.car").await.unwrap();
    provider.wait_until_idle().await;

    let cache = provider.server.cache();
    for _ in 0..200 {
        if !cache.contains(&root) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!cache.contains(&root), "idle layout was not evicted");

    fetch_once("second.car").await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.computations, 2);
    assert!(stats.evictions >= 1);
}

#[tokio::test]
async fn test_stop_aborts_inflight_transfers() {
    init_tracing();

    let provider = Provider::start(LayoutCacheConfig::default()).await;
    let (root, size) = provider.import(&random_bytes(16 * 1024 * 1024, 8)).await;
    let auth = provider.authorize("client-1", root, size).await;

    // Open the archive and read only the first bytes so the server stalls
    let mut stream = TcpStream::connect(provider.http_addr).await.unwrap();
    let request = format!(
        "GET /{} HTTP/1.1\r\nHost: localhost\r\nAuthorization: {}\r\n\r\n",
        root, auth
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    assert!(provider.server.stop().await);
    let finished = provider.server.registry().finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, TransferStatus::Aborted);
    assert!(finished[0].bytes_transferred < size);
}
