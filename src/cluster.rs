// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use get_if_addrs::{get_if_addrs, IfAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::traits::CounterError;

/// Delay before retrying a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Delay between outbound dial attempts to an unreachable peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on a single inbound frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Callbacks delivered by a cluster endpoint.
///
/// Both callbacks are invoked from the endpoint's network tasks and must not
/// block: implementors enqueue into their own mailbox and return.
pub trait ClusterListener: Send + Sync {
    /// One inbound frame. The sender identity is whatever the transport
    /// supplies; an empty string means the payload must identify the sender.
    fn on_message(&self, sender_identity: &str, message: &[u8]);
    /// An outbound dial succeeded; the peer can now be sent to.
    fn on_new_peer_connected(&self, peer: &str);
}

/// A small cluster abstraction over the messaging transport: bind/listen,
/// maintain outbound peer sockets, broadcast, unicast.
///
/// Sends are fire-and-forget: neither `broadcast_message` nor
/// `send_message_to_peer` guarantees delivery, both return promptly, and a
/// lost message is made good by the next state broadcast.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Binds the listening socket and starts the receive loop. Errors on a
    /// failed bind and on a repeated start.
    async fn start(&self) -> Result<(), CounterError>;
    /// Cancels the receive loop and closes every socket. Idempotent; the
    /// endpoint instance cannot be started again afterwards.
    async fn stop(&self);
    /// Declarative peer list: closes removed peers, dials added ones.
    /// Callers are never blocked on a dial.
    async fn update_peers(&self, peers: Vec<String>);
    /// The currently declared peer URLs.
    async fn peers(&self) -> Vec<String>;
    /// Dials one peer if not yet known, leaving the rest untouched.
    fn ensure_peer(&self, peer: &str);
    /// Fans a frame out to every current outbound peer socket.
    fn broadcast_message(&self, message: Vec<u8>);
    /// Sends a frame to one peer, dropping it if the peer is unknown.
    fn send_message_to_peer(&self, peer: &str, message: Vec<u8>);
    /// Registers a listener. Listeners added after `start` see only
    /// subsequent traffic.
    fn add_listener(&self, listener: Arc<dyn ClusterListener>);
    /// The IP this endpoint advertises in discovery handshakes.
    fn my_ip(&self) -> String;
    /// The TCP port this endpoint listens on.
    fn my_tcp_port(&self) -> u16;
}

type ListenerRegistry = Arc<RwLock<Vec<Arc<dyn ClusterListener>>>>;

/// TCP implementation of [`Cluster`].
///
/// One listening socket accepts inbound push connections; one outbound
/// socket per declared peer is kept dialed by a dedicated writer task that
/// reconnects with a delay. Frames are length-prefixed (4-byte big-endian)
/// JSON payloads. All shared endpoint state lives behind the endpoint's own
/// mailbox; the handle is cheap to clone.
///
/// Must be constructed inside a Tokio runtime.
#[derive(Clone)]
pub struct TcpCluster {
    port: u16,
    mailbox: mpsc::UnboundedSender<ClusterCommand>,
    listeners: ListenerRegistry,
}

enum ClusterCommand {
    Start(oneshot::Sender<Result<(), CounterError>>),
    Stop(oneshot::Sender<()>),
    UpdatePeers(Vec<String>, oneshot::Sender<()>),
    Peers(oneshot::Sender<Vec<String>>),
    EnsurePeer(String),
    Broadcast(Vec<u8>),
    SendToPeer(String, Vec<u8>),
}

impl TcpCluster {
    /// Creates an endpoint that will listen at `bind_url`
    /// (`tcp://<host-or-empty>:<port>`; an empty host binds all
    /// interfaces). The bind itself happens on `start`.
    pub fn new(identity: impl Into<String>, bind_url: impl Into<String>) -> Self {
        let identity = identity.into();
        let bind_url = bind_url.into();
        let port = parse_url(&bind_url).map(|(_, port)| port).unwrap_or(0);
        let listeners: ListenerRegistry = Arc::new(RwLock::new(Vec::new()));

        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(false);
        let actor = ClusterActor {
            identity,
            bind_url,
            listeners: listeners.clone(),
            peers: HashMap::new(),
            phase: Phase::Created,
            cancel: cancel_tx,
            accept_task: None,
        };
        tokio::spawn(actor.run(rx));

        Self {
            port,
            mailbox: tx,
            listeners,
        }
    }

    async fn request<T: Default>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ClusterCommand,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(make(tx));
        rx.await.unwrap_or_default()
    }
}

#[async_trait]
impl Cluster for TcpCluster {
    async fn start(&self) -> Result<(), CounterError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(ClusterCommand::Start(tx));
        rx.await.unwrap_or(Err(CounterError::Stopped))
    }

    async fn stop(&self) {
        self.request(ClusterCommand::Stop).await
    }

    async fn update_peers(&self, peers: Vec<String>) {
        self.request(|tx| ClusterCommand::UpdatePeers(peers, tx))
            .await
    }

    async fn peers(&self) -> Vec<String> {
        self.request(ClusterCommand::Peers).await
    }

    fn ensure_peer(&self, peer: &str) {
        let _ = self
            .mailbox
            .send(ClusterCommand::EnsurePeer(peer.to_string()));
    }

    fn broadcast_message(&self, message: Vec<u8>) {
        let _ = self.mailbox.send(ClusterCommand::Broadcast(message));
    }

    fn send_message_to_peer(&self, peer: &str, message: Vec<u8>) {
        let _ = self
            .mailbox
            .send(ClusterCommand::SendToPeer(peer.to_string(), message));
    }

    fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    fn my_ip(&self) -> String {
        advertised_ip()
    }

    fn my_tcp_port(&self) -> u16 {
        self.port
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Listening,
    Stopped,
}

struct PeerLink {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    writer: JoinHandle<()>,
}

struct ClusterActor {
    identity: String,
    bind_url: String,
    listeners: ListenerRegistry,
    peers: HashMap<String, PeerLink>,
    phase: Phase,
    cancel: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl ClusterActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ClusterCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                ClusterCommand::Start(reply) => {
                    let _ = reply.send(self.start().await);
                }
                ClusterCommand::Stop(reply) => {
                    self.stop();
                    let _ = reply.send(());
                }
                ClusterCommand::UpdatePeers(peers, reply) => {
                    self.update_peers(peers);
                    let _ = reply.send(());
                }
                ClusterCommand::Peers(reply) => {
                    let _ = reply.send(self.peers.keys().cloned().collect());
                }
                ClusterCommand::EnsurePeer(peer) => {
                    if self.phase != Phase::Stopped && !self.peers.contains_key(&peer) {
                        self.connect_peer(peer);
                    }
                }
                ClusterCommand::Broadcast(message) => {
                    for link in self.peers.values() {
                        let _ = link.outbox.send(message.clone());
                    }
                }
                ClusterCommand::SendToPeer(peer, message) => match self.peers.get(&peer) {
                    Some(link) => {
                        let _ = link.outbox.send(message);
                    }
                    None => {
                        debug!(identity = %self.identity, peer = %peer, "dropping message to unknown peer");
                    }
                },
            }
        }
    }

    async fn start(&mut self) -> Result<(), CounterError> {
        match self.phase {
            Phase::Listening => return Err(CounterError::AlreadyStarted),
            Phase::Stopped => return Err(CounterError::Stopped),
            Phase::Created => {}
        }
        let (host, port) = parse_url(&self.bind_url)?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| CounterError::Bind(format!("{}: {e}", self.bind_url)))?;
        info!(identity = %self.identity, bind_url = %self.bind_url, "cluster endpoint listening");
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.identity.clone(),
            self.listeners.clone(),
            self.cancel.subscribe(),
        )));
        self.phase = Phase::Listening;
        Ok(())
    }

    fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        let _ = self.cancel.send(true);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (peer, link) in self.peers.drain() {
            debug!(identity = %self.identity, peer = %peer, "closing peer connection");
            link.writer.abort();
        }
        info!(identity = %self.identity, "cluster endpoint stopped");
    }

    fn update_peers(&mut self, peers: Vec<String>) {
        if self.phase == Phase::Stopped {
            debug!(identity = %self.identity, "ignoring peer update on stopped endpoint");
            return;
        }
        let desired: HashSet<String> = peers.into_iter().collect();
        let current: HashSet<String> = self.peers.keys().cloned().collect();

        for removed in current.difference(&desired) {
            if let Some(link) = self.peers.remove(removed) {
                info!(identity = %self.identity, peer = %removed, "disconnecting removed peer");
                link.writer.abort();
            }
        }
        for added in desired.difference(&current) {
            self.connect_peer(added.clone());
        }
    }

    fn connect_peer(&mut self, peer: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(peer_writer(
            peer.clone(),
            self.identity.clone(),
            rx,
            self.listeners.clone(),
            self.cancel.subscribe(),
        ));
        self.peers.insert(peer, PeerLink { outbox: tx, writer });
    }
}

/// Accepts inbound connections until cancelled, spawning one reader per
/// connection. Accept errors back off briefly and retry.
async fn accept_loop(
    listener: TcpListener,
    identity: String,
    listeners: ListenerRegistry,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(identity = %identity, remote = %remote, "accepted peer connection");
                    tokio::spawn(read_connection(
                        stream,
                        identity.clone(),
                        listeners.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "accept failed, retrying");
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
}

/// Reads frames off one inbound connection and delivers them to every
/// registered listener until EOF, a read error, or cancellation.
async fn read_connection(
    mut stream: TcpStream,
    identity: String,
    listeners: ListenerRegistry,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.changed() => break,
            frame = read_frame(&mut stream) => frame,
        };
        match frame {
            Ok(Some(message)) => {
                for listener in snapshot_listeners(&listeners) {
                    listener.on_message("", &message);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(identity = %identity, error = %e, "read failed, closing connection");
                break;
            }
        }
    }
}

/// One length-prefixed frame; `None` on clean EOF at a frame boundary.
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(Some(message))
}

async fn write_frame(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(message.len() as u32).to_be_bytes()).await?;
    stream.write_all(message).await
}

/// Keeps one outbound peer socket dialed, forwarding queued frames.
/// Announces every successful dial to the listeners so they can push an
/// initial state snapshot; a dropped connection is redialed after a delay.
async fn peer_writer(
    peer: String,
    identity: String,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    listeners: ListenerRegistry,
    mut cancel: watch::Receiver<bool>,
) {
    let addr = match parse_url(&peer) {
        Ok((host, port)) => format!("{host}:{port}"),
        Err(e) => {
            warn!(identity = %identity, peer = %peer, error = %e, "not dialing invalid peer URL");
            return;
        }
    };
    let mut dial_failure_logged = false;
    'reconnect: loop {
        let mut stream = tokio::select! {
            _ = cancel.changed() => return,
            connected = TcpStream::connect(&addr) => match connected {
                Ok(stream) => stream,
                Err(e) => {
                    if !dial_failure_logged {
                        warn!(identity = %identity, peer = %peer, error = %e, "dial failed, will keep retrying");
                        dial_failure_logged = true;
                    }
                    tokio::select! {
                        _ = cancel.changed() => return,
                        _ = sleep(RECONNECT_DELAY) => continue 'reconnect,
                    }
                }
            },
        };
        dial_failure_logged = false;
        info!(identity = %identity, peer = %peer, "connected to peer");
        for listener in snapshot_listeners(&listeners) {
            listener.on_new_peer_connected(&peer);
        }
        loop {
            tokio::select! {
                _ = cancel.changed() => return,
                message = outbox.recv() => match message {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut stream, &message).await {
                            warn!(identity = %identity, peer = %peer, error = %e, "send failed, reconnecting");
                            continue 'reconnect;
                        }
                    }
                    // Link closed: the peer was removed or the endpoint stopped.
                    None => return,
                },
            }
        }
    }
}

fn snapshot_listeners(listeners: &ListenerRegistry) -> Vec<Arc<dyn ClusterListener>> {
    listeners
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Splits a `tcp://<host-or-empty>:<port>` URL. An empty host means all
/// interfaces.
pub(crate) fn parse_url(url: &str) -> Result<(String, u16), CounterError> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| CounterError::InvalidAddress(url.to_string()))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| CounterError::InvalidAddress(url.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CounterError::InvalidAddress(url.to_string()))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

/// The first advertisable (non-loopback) interface address, falling back to
/// loopback so single-host clusters still hand out something dialable.
fn advertised_ip() -> String {
    match get_if_addrs() {
        Ok(ifaces) => {
            for iface in ifaces {
                let addr = match iface.addr {
                    IfAddr::V4(v4) => IpAddr::V4(v4.ip),
                    IfAddr::V6(v6) => IpAddr::V6(v6.ip),
                };
                if let IpAddr::V4(v4) = addr {
                    if !v4.is_loopback() {
                        return v4.to_string();
                    }
                }
            }
            "127.0.0.1".to_string()
        }
        Err(e) => {
            warn!(error = %e, "cannot enumerate interfaces, advertising loopback");
            "127.0.0.1".to_string()
        }
    }
}
