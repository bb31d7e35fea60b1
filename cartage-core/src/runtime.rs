//! Node lifecycle and one-shot commands
//!
//! `run_node` wires the block store, token store, layout cache and both
//! transfer bindings together and runs until Ctrl+C. The remaining
//! functions back the `import`, `authorize` and `fetch` subcommands.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::Multiaddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::auth::{
    basic_auth_header, generate_auth_token, unix_now, AuthError, AuthTokenDb, AuthValue,
};
use crate::car::{compute_layout, CarError};
use crate::client::{
    Endpoint, FetchError, FetchOptions, HttpTransport, TransferOutcome, TransferRequest,
};
use crate::config::{AuthorizeCommand, Config, FetchCommand, ImportCommand};
use crate::content_id::{parse_cid_str, CidError};
use crate::dag::{DagBuilder, ImportError, ImportedDag};
use crate::layout_cache::LayoutCache;
use crate::metrics::Metrics;
use crate::p2p::{P2PError, P2pNode};
use crate::registry::TransferRegistry;
use crate::server::{CarServer, ServeError};
use crate::storage::{BlockStore, StorageError};

/// How often expired tokens are purged when a token TTL is configured
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Auth store error: {0}")]
    Auth(#[from] AuthError),

    #[error("P2P error: {0}")]
    P2p(#[from] P2PError),

    #[error("Server error: {0}")]
    Serve(#[from] ServeError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Import failed: {0}")]
    Import(#[from] ImportError),

    #[error("Archive error: {0}")]
    Archive(#[from] CarError),

    #[error("Invalid CID: {0}")]
    Cid(#[from] CidError),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary of an imported file
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub dag: ImportedDag,
    /// Size of the CARv1 archive the root serves as
    pub archive_size: u64,
}

/// Issued transfer credentials
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub authorization: String,
    pub archive_size: u64,
}

/// Run the transfer node with the given configuration
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let store = BlockStore::open(config.blocks_dir())?;
    let tokens = AuthTokenDb::open(config.auth_dir())?;
    let cache = LayoutCache::new(store.clone(), config.layout_cache_config());
    let server = Arc::new(CarServer::new(
        store,
        tokens.clone(),
        cache,
        TransferRegistry::new(),
        Metrics::new(),
        config.server_config(),
    ));

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.p2p_port)
        .parse()
        .map_err(|e| NodeError::Address(format!("{}", e)))?;
    let node = P2pNode::start(listen_addr, None).await?;
    let incoming = node.accept_http()?;

    info!("Node started with peer ID: {}", node.peer_id());
    if let Some(addr) = node.dial_addr() {
        info!("Tunnel endpoint: libp2p://{}", addr);
    }

    let listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;

    let http_task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_http(listener).await })
    };
    let tunnel_task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_libp2p(incoming).await })
    };
    let purge_task = config
        .token_ttl_secs
        .map(|ttl| tokio::spawn(purge_expired_tokens(tokens, ttl)));

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    if !server.stop().await {
        warn!("Some transfers were still running at shutdown");
    }
    if let Some(task) = purge_task {
        task.abort();
    }

    match http_task.await {
        Ok(Err(e)) => error!("HTTP binding failed: {}", e),
        Err(e) => error!("HTTP binding task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = tunnel_task.await {
        error!("libp2p binding task panicked: {}", e);
    }
    node.shutdown().await;

    info!("Node stopped");
    Ok(())
}

async fn purge_expired_tokens(tokens: AuthTokenDb, ttl_secs: u64) {
    let mut interval = tokio::time::interval(TOKEN_PURGE_INTERVAL);
    loop {
        interval.tick().await;
        let before = unix_now().saturating_sub(ttl_secs);
        match tokens.delete_expired(before).await {
            Ok(0) => {}
            Ok(n) => info!("Purged {} expired transfer tokens", n),
            Err(e) => warn!("Failed to purge expired tokens: {}", e),
        }
    }
}

/// Import a file into the block store and report its root
pub async fn import_file(config: &Config, cmd: &ImportCommand) -> Result<ImportSummary, NodeError> {
    let store = BlockStore::open(config.blocks_dir())?;
    let file = tokio::fs::File::open(&cmd.file).await?;

    let dag = DagBuilder::new(store.clone())
        .with_chunk_size(config.chunk_size)
        .with_max_links(config.max_links)
        .import(file)
        .await?;
    let layout = compute_layout(&store, dag.root).await?;

    info!(
        "Imported {} ({} bytes, {} blocks) as {}",
        cmd.file.display(),
        dag.file_size,
        dag.block_count,
        dag.root
    );

    Ok(ImportSummary {
        dag,
        archive_size: layout.total_size,
    })
}

/// Issue a token that lets `cmd.client` retrieve the archive for `cmd.root`
pub async fn authorize(config: &Config, cmd: &AuthorizeCommand) -> Result<IssuedToken, NodeError> {
    let root = parse_cid_str(&cmd.root)?;
    let proposal = match &cmd.proposal {
        Some(p) => parse_cid_str(p)?,
        None => root,
    };

    let store = BlockStore::open(config.blocks_dir())?;
    let tokens = AuthTokenDb::open(config.auth_dir())?;

    // Fails if the payload was never imported
    let layout = compute_layout(&store, root).await?;

    let token = generate_auth_token();
    let value = AuthValue::new(cmd.client.clone(), proposal, root, layout.total_size);
    tokens.put(&token, &value).await?;

    info!("Authorized {} for {} ({} bytes)", cmd.client, root, layout.total_size);

    Ok(IssuedToken {
        authorization: basic_auth_header(&cmd.client, &token),
        token,
        archive_size: layout.total_size,
    })
}

/// Download an archive, logging progress as it arrives
pub async fn fetch(cmd: &FetchCommand) -> Result<TransferOutcome, NodeError> {
    let endpoint = Endpoint::parse(&cmd.endpoint)?;
    let root = parse_cid_str(&cmd.root)?;

    let mut transport = HttpTransport::new().with_options(FetchOptions {
        max_resume_attempts: cmd.max_resume_attempts,
        verify_archive: !cmd.no_verify,
        resume_from_existing: cmd.resume,
    });

    let node = match endpoint {
        Endpoint::Libp2p(_) => {
            let listen: Multiaddr = "/ip4/0.0.0.0/tcp/0"
                .parse()
                .map_err(|e| NodeError::Address(format!("{}", e)))?;
            let node = Arc::new(P2pNode::start(listen, None).await?);
            transport = transport.with_p2p(node.clone());
            Some(node)
        }
        Endpoint::Http(_) => None,
    };

    info!("Fetching {} from {}", root, endpoint);
    let request = TransferRequest {
        endpoint,
        root,
        authorization: basic_auth_header(&cmd.client, &cmd.token),
        expected_size: cmd.expected_size,
    };

    let mut transfer = transport.fetch(request, cmd.output.clone());
    while let Some(event) = transfer.next().await {
        match cmd.expected_size {
            Some(total) if total > 0 => debug!(
                "Received {} / {} bytes ({}%)",
                event.bytes_received,
                total,
                event.bytes_received * 100 / total
            ),
            _ => debug!("Received {} bytes", event.bytes_received),
        }
    }
    let outcome = transfer.finish().await;

    if let Some(node) = node {
        node.shutdown().await;
    }

    let outcome = outcome?;
    info!(
        "Fetched {} bytes into {} in {:?} ({} attempts)",
        outcome.bytes_received,
        outcome.path.display(),
        outcome.elapsed,
        outcome.attempts
    );
    Ok(outcome)
}
