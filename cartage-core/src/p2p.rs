//! P2P networking layer using rust-libp2p
//!
//! TCP transport with Noise encryption and Mplex multiplexing. On top of
//! Ping and Identify the node runs `libp2p-stream`, which hands raw
//! bidirectional streams for [`HTTP_PROTOCOL`] to the archive server and
//! client. The swarm itself is owned by a driver task; [`P2pNode`] talks to
//! it over a command channel.

use futures::StreamExt;
use libp2p::{
    identify, identity::Keypair, multiaddr::Protocol, noise, ping, swarm::SwarmEvent, tcp,
    Multiaddr, PeerId, Stream, StreamProtocol, Swarm, SwarmBuilder,
};
use libp2p_mplex as mplex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Protocol carrying HTTP/1.1 requests for archives over a libp2p stream
pub const HTTP_PROTOCOL: StreamProtocol = StreamProtocol::new("/cartage/http/1.0.0");

const IDENTIFY_PROTOCOL: &str = "/cartage/id/1.0.0";

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("P2P node is not running")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network behaviour: keep-alive, identification and raw streams
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct Behaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

/// Create a new P2P swarm, generating an identity if none is given
pub fn create_swarm(keypair: Option<Keypair>) -> Result<Swarm<Behaviour>, P2PError> {
    let keypair = keypair.unwrap_or_else(Keypair::generate_ed25519);
    let peer_id = PeerId::from(keypair.public());

    info!("Local peer ID: {}", peer_id);

    let behaviour = Behaviour {
        ping: ping::Behaviour::new(ping::Config::new()),
        identify: identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        )),
        stream: libp2p_stream::Behaviour::new(),
    };

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            mplex::MplexConfig::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|_| behaviour)
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

/// Peer id named by a trailing `/p2p/<peer>` component
pub fn peer_id_from_addr(addr: &Multiaddr) -> Result<PeerId, P2PError> {
    addr.iter()
        .find_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .ok_or_else(|| P2PError::InvalidAddress(format!("{} has no /p2p component", addr)))
}

enum Command {
    Dial {
        peer_id: PeerId,
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), P2PError>>,
    },
    Shutdown,
}

/// Handle on a running libp2p host
pub struct P2pNode {
    peer_id: PeerId,
    control: libp2p_stream::Control,
    commands: mpsc::Sender<Command>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl P2pNode {
    /// Start a node listening on `listen_addr` and wait until it is bound
    pub async fn start(listen_addr: Multiaddr, keypair: Option<Keypair>) -> Result<Self, P2PError> {
        let mut swarm = create_swarm(keypair)?;
        let peer_id = *swarm.local_peer_id();
        let control = swarm.behaviour().stream.new_control();

        swarm
            .listen_on(listen_addr)
            .map_err(|e| P2PError::Transport(format!("Failed to listen: {}", e)))?;

        let first = loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => break address,
                SwarmEvent::ListenerError { error, .. } => {
                    return Err(P2PError::Transport(error.to_string()))
                }
                SwarmEvent::ListenerClosed { reason, .. } => {
                    return Err(P2PError::Transport(format!("Listener closed: {:?}", reason)))
                }
                _ => {}
            }
        };
        info!("P2P listening on {}/p2p/{}", first, peer_id);

        let listen_addrs = Arc::new(Mutex::new(vec![first]));
        let (commands, command_rx) = mpsc::channel(64);
        let driver = tokio::spawn(drive_swarm(swarm, command_rx, Arc::clone(&listen_addrs)));

        Ok(Self {
            peer_id,
            control,
            commands,
            listen_addrs,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Listen addresses without the `/p2p` suffix
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().clone()
    }

    /// A full dialable address including `/p2p/<peer>`
    pub fn dial_addr(&self) -> Option<Multiaddr> {
        self.listen_addrs
            .lock()
            .first()
            .map(|a| a.clone().with(Protocol::P2p(self.peer_id)))
    }

    pub fn control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Start accepting inbound [`HTTP_PROTOCOL`] streams
    pub fn accept_http(&self) -> Result<libp2p_stream::IncomingStreams, P2PError> {
        self.control
            .clone()
            .accept(HTTP_PROTOCOL)
            .map_err(|e| P2PError::Stream(e.to_string()))
    }

    /// Connect to the peer named in `addr`, returning once a connection exists
    pub async fn dial(&self, addr: &Multiaddr) -> Result<PeerId, P2PError> {
        let peer_id = peer_id_from_addr(addr)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dial {
                peer_id,
                addr: addr.clone(),
                reply,
            })
            .await
            .map_err(|_| P2PError::Closed)?;
        rx.await.map_err(|_| P2PError::Closed)??;
        Ok(peer_id)
    }

    /// Open an [`HTTP_PROTOCOL`] stream to the peer at `addr`
    pub async fn open_http_stream(&self, addr: &Multiaddr) -> Result<Stream, P2PError> {
        let peer_id = self.dial(addr).await?;
        let stream = self
            .control
            .clone()
            .open_stream(peer_id, HTTP_PROTOCOL)
            .await
            .map_err(|e| P2PError::Stream(e.to_string()))?;
        debug!("Opened HTTP stream to {}", peer_id);
        Ok(stream)
    }

    /// Stop the swarm driver
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

impl Drop for P2pNode {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

async fn drive_swarm(
    mut swarm: Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
) {
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), P2PError>>>> =
        HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Dial { peer_id, addr, reply }) => {
                    if swarm.is_connected(&peer_id) {
                        let _ = reply.send(Ok(()));
                        continue;
                    }
                    match swarm.dial(addr.clone()) {
                        Ok(()) => {
                            debug!("Dialing {} at {}", peer_id, addr);
                            pending_dials.entry(peer_id).or_default().push(reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(P2PError::Dial(e.to_string())));
                        }
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::NewListenAddr { address, .. } => {
                    info!("Listening on {}", address);
                    let mut addrs = listen_addrs.lock();
                    if !addrs.contains(&address) {
                        addrs.push(address);
                    }
                }
                SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                    info!(
                        "Connected to peer: {} at {}",
                        peer_id,
                        endpoint.get_remote_address()
                    );
                    for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                        let _ = reply.send(Ok(()));
                    }
                }
                SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                    debug!("Connection closed with {}: {:?}", peer_id, cause);
                }
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    error!("Outgoing connection error to {:?}: {}", peer_id, error);
                    if let Some(peer_id) = peer_id {
                        for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                            let _ = reply.send(Err(P2PError::Dial(error.to_string())));
                        }
                    }
                }
                SwarmEvent::IncomingConnectionError { send_back_addr, error, .. } => {
                    warn!("Incoming connection error from {}: {}", send_back_addr, error);
                }
                SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                    debug!("Identified {} running {}", peer_id, info.agent_version);
                }
                SwarmEvent::Behaviour(BehaviourEvent::Ping(event)) => {
                    if let Err(e) = event.result {
                        debug!("Ping to {} failed: {}", event.peer, e);
                    }
                }
                _ => {}
            },
        }
    }

    info!("P2P node stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::FuturesAsyncReadCompatExt;

    fn localhost() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    #[test]
    fn test_create_swarm() {
        let swarm = create_swarm(None).unwrap();
        assert!(!swarm.local_peer_id().to_string().is_empty());
    }

    #[test]
    fn test_peer_id_from_addr() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", peer).parse().unwrap();
        assert_eq!(peer_id_from_addr(&addr).unwrap(), peer);
        assert!(peer_id_from_addr(&localhost()).is_err());
    }

    #[tokio::test]
    async fn test_node_reports_dial_addr() {
        let node = P2pNode::start(localhost(), None).await.unwrap();
        let addr = node.dial_addr().unwrap();
        assert_eq!(peer_id_from_addr(&addr).unwrap(), node.peer_id());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_http_stream_between_nodes() {
        let server = P2pNode::start(localhost(), None).await.unwrap();
        let client = P2pNode::start(localhost(), None).await.unwrap();
        let mut incoming = server.accept_http().unwrap();

        let echo = tokio::spawn(async move {
            let (peer, stream) = incoming.next().await.unwrap();
            let mut stream = stream.compat();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            peer
        });

        let stream = client
            .open_http_stream(&server.dial_addr().unwrap())
            .await
            .unwrap();
        let mut stream = stream.compat();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello");
        assert_eq!(echo.await.unwrap(), client.peer_id());
    }

    #[tokio::test]
    async fn test_dial_unreachable_peer_fails() {
        let node = P2pNode::start(localhost(), None).await.unwrap();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        assert!(node.dial(&addr).await.is_err());
    }
}
