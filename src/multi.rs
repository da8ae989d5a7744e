// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterListener, TcpCluster};
use crate::emergency::EmergencyPersistence;
use crate::envelope::{
    NetworkMessage, GCOUNTER_MESSAGE, METADATA_IP, METADATA_TCP_PORT, PEER_HELLO_MESSAGE,
    PEER_OHAI_MESSAGE,
};
use crate::persistent::PersistentGCounter;
use crate::state::GCounterState;
use crate::traits::{
    ClusterObserver, CounterError, CounterObserver, GCounterStateSink, NoOpClusterObserver,
    NoOpCounterObserver, Persistent,
};

/// File extension of persisted counter states.
pub const COUNTER_FILE_EXTENSION: &str = "gcounter";

/// Name a counter snapshot resolves to when its envelope carries no name.
const SINGLETON_NAME: &str = "singleton";

/// A named map of persistent counters replicated through one cluster
/// endpoint.
///
/// Owns one [`PersistentGCounter`] per counter name, all backed by files in
/// one state directory and all wired back to this replicator as their state
/// sink. On every local mutation the changed counter's snapshot is wrapped
/// in an envelope and broadcast; inbound snapshots are merged into the named
/// counter, silently creating it if unseen. New counter names therefore
/// propagate cluster-wide without any registration step.
///
/// The replicator is itself an actor: every public operation runs as one
/// mailbox turn. It must own its endpoint's listener slot exclusively (one
/// replicator per endpoint).
///
/// Must be constructed inside a Tokio runtime.
#[derive(Clone)]
pub struct MultiGCounter {
    mailbox: mpsc::UnboundedSender<ReplicatorCommand>,
    cluster: Arc<dyn Cluster>,
}

enum ReplicatorCommand {
    Increment(String),
    Value(String, oneshot::Sender<i64>),
    GetCounter(String, oneshot::Sender<PersistentGCounter>),
    MergeWith(GCounterState),
    Propagate(GCounterState),
    Incoming(String, Vec<u8>),
    NewPeer(String),
    UpdatePeers(Vec<String>, oneshot::Sender<()>),
    PersistAll(oneshot::Sender<()>),
    PersistOne(String, oneshot::Sender<()>),
    LoadAll(oneshot::Sender<()>),
    PersistOnSignal,
}

impl MultiGCounter {
    /// Replicator with its own TCP endpoint and no observers.
    pub fn new(
        identity: impl Into<String>,
        dirname: impl Into<PathBuf>,
        bind_url: impl Into<String>,
    ) -> Self {
        let identity = identity.into();
        let cluster = Arc::new(TcpCluster::new(identity.clone(), bind_url));
        Self::in_cluster(identity, dirname, cluster)
    }

    /// Replicator with its own TCP endpoint and a value observer.
    pub fn observable(
        identity: impl Into<String>,
        dirname: impl Into<PathBuf>,
        bind_url: impl Into<String>,
        observer: Arc<dyn CounterObserver>,
    ) -> Self {
        let identity = identity.into();
        let cluster = Arc::new(TcpCluster::new(identity.clone(), bind_url));
        Self::with_observers(
            identity,
            dirname,
            cluster,
            observer,
            Arc::new(NoOpClusterObserver),
        )
    }

    /// Replicator sharing a caller-supplied endpoint.
    pub fn in_cluster(
        identity: impl Into<String>,
        dirname: impl Into<PathBuf>,
        cluster: Arc<dyn Cluster>,
    ) -> Self {
        Self::with_observers(
            identity,
            dirname,
            cluster,
            Arc::new(NoOpCounterObserver),
            Arc::new(NoOpClusterObserver),
        )
    }

    /// Replicator sharing a caller-supplied endpoint, with a value observer.
    pub fn observable_in_cluster(
        identity: impl Into<String>,
        dirname: impl Into<PathBuf>,
        cluster: Arc<dyn Cluster>,
        observer: Arc<dyn CounterObserver>,
    ) -> Self {
        Self::with_observers(
            identity,
            dirname,
            cluster,
            observer,
            Arc::new(NoOpClusterObserver),
        )
    }

    /// The fully general constructor.
    pub fn with_observers(
        identity: impl Into<String>,
        dirname: impl Into<PathBuf>,
        cluster: Arc<dyn Cluster>,
        observer: Arc<dyn CounterObserver>,
        cluster_observer: Arc<dyn ClusterObserver>,
    ) -> Self {
        let identity = identity.into();
        let dirname = dirname.into();
        if let Err(e) = fs::create_dir_all(&dirname) {
            panic!(
                "cannot create counter state directory {}: {e}",
                dirname.display()
            );
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        cluster.add_listener(Arc::new(ReplicatorListener {
            mailbox: tx.clone(),
        }));

        let mut actor = ReplicatorActor {
            identity,
            dirname,
            counters: HashMap::new(),
            cluster: cluster.clone(),
            observer,
            cluster_observer,
            mailbox: tx.clone(),
            persist_on_signal: false,
        };
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                actor.handle(command).await;
            }
        });

        Self {
            mailbox: tx,
            cluster,
        }
    }

    /// Binds the endpoint and starts receiving.
    pub async fn start(&self) -> Result<(), CounterError> {
        self.cluster.start().await
    }

    /// Stops the endpoint. Pending local mutations still persist.
    pub async fn stop(&self) {
        self.cluster.stop().await
    }

    /// Declares the peer list, then broadcasts a discovery greeting carrying
    /// this replica's address so peers behind asymmetric routes can dial
    /// back.
    pub async fn update_peers(&self, peers: Vec<String>) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .mailbox
            .send(ReplicatorCommand::UpdatePeers(peers, tx));
        let _ = rx.await;
    }

    /// Enqueues an increment of the named counter, creating it if unseen.
    pub fn increment(&self, name: impl Into<String>) {
        let _ = self.mailbox.send(ReplicatorCommand::Increment(name.into()));
    }

    /// Enqueues a merge of a remote snapshot into the counter it names. A
    /// snapshot without a name resolves to `"singleton"`.
    pub fn merge_with(&self, state: GCounterState) {
        let _ = self.mailbox.send(ReplicatorCommand::MergeWith(state));
    }

    /// Returns the named counter's total, creating the counter if unseen.
    pub async fn value(&self, name: impl Into<String>) -> i64 {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .mailbox
            .send(ReplicatorCommand::Value(name.into(), tx));
        rx.await.unwrap_or_default()
    }

    /// Returns a handle to the named counter, creating it if unseen.
    pub async fn get_counter(&self, name: impl Into<String>) -> Option<PersistentGCounter> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .mailbox
            .send(ReplicatorCommand::GetCounter(name.into(), tx));
        rx.await.ok()
    }

    /// Writes every owned counter to disk, suspending until all are done.
    pub async fn persist_sync(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(ReplicatorCommand::PersistAll(tx));
        let _ = rx.await;
    }

    /// Writes one named counter to disk.
    pub async fn persist_one_sync(&self, name: impl Into<String>) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .mailbox
            .send(ReplicatorCommand::PersistOne(name.into(), tx));
        let _ = rx.await;
    }

    /// Eagerly instantiates every persisted counter found in the state
    /// directory, seeding the value observer with each starting value.
    pub async fn load_all_sync(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(ReplicatorCommand::LoadAll(tx));
        let _ = rx.await;
    }

    /// Registers all current and future counters with the process-wide
    /// emergency-persistence registry.
    pub fn should_persist_on_signal(&self) {
        let _ = self.mailbox.send(ReplicatorCommand::PersistOnSignal);
    }
}

#[async_trait]
impl Persistent for MultiGCounter {
    async fn persist_sync(&self) {
        MultiGCounter::persist_sync(self).await;
    }
}

/// Forwards endpoint callbacks into the replicator mailbox.
struct ReplicatorListener {
    mailbox: mpsc::UnboundedSender<ReplicatorCommand>,
}

impl ClusterListener for ReplicatorListener {
    fn on_message(&self, sender_identity: &str, message: &[u8]) {
        let _ = self.mailbox.send(ReplicatorCommand::Incoming(
            sender_identity.to_string(),
            message.to_vec(),
        ));
    }

    fn on_new_peer_connected(&self, peer: &str) {
        let _ = self
            .mailbox
            .send(ReplicatorCommand::NewPeer(peer.to_string()));
    }
}

/// Receives each owned counter's post-mutation snapshot.
struct ReplicatorSink {
    mailbox: mpsc::UnboundedSender<ReplicatorCommand>,
}

impl GCounterStateSink for ReplicatorSink {
    fn set_state(&self, state: GCounterState) {
        let _ = self.mailbox.send(ReplicatorCommand::Propagate(state));
    }
}

struct ReplicatorActor {
    identity: String,
    dirname: PathBuf,
    counters: HashMap<String, PersistentGCounter>,
    cluster: Arc<dyn Cluster>,
    observer: Arc<dyn CounterObserver>,
    cluster_observer: Arc<dyn ClusterObserver>,
    mailbox: mpsc::UnboundedSender<ReplicatorCommand>,
    persist_on_signal: bool,
}

impl ReplicatorActor {
    async fn handle(&mut self, command: ReplicatorCommand) {
        match command {
            ReplicatorCommand::Increment(name) => {
                self.get_or_create(&name).increment();
            }
            ReplicatorCommand::Value(name, reply) => {
                let value = self.get_or_create(&name).value().await;
                let _ = reply.send(value);
            }
            ReplicatorCommand::GetCounter(name, reply) => {
                let _ = reply.send(self.get_or_create(&name).clone());
            }
            ReplicatorCommand::MergeWith(state) => self.merge(state),
            ReplicatorCommand::Propagate(state) => self.propagate(state).await,
            ReplicatorCommand::Incoming(identity, message) => self.incoming(identity, message),
            ReplicatorCommand::NewPeer(peer) => self.send_all_counters_to(&peer).await,
            ReplicatorCommand::UpdatePeers(peers, reply) => {
                self.update_peers(peers).await;
                let _ = reply.send(());
            }
            ReplicatorCommand::PersistAll(reply) => {
                for counter in self.counters.values() {
                    counter.persist_sync().await;
                }
                let _ = reply.send(());
            }
            ReplicatorCommand::PersistOne(name, reply) => {
                self.get_or_create(&name).persist_sync().await;
                let _ = reply.send(());
            }
            ReplicatorCommand::LoadAll(reply) => {
                self.load_all();
                let _ = reply.send(());
            }
            ReplicatorCommand::PersistOnSignal => {
                self.persist_on_signal = true;
                for counter in self.counters.values() {
                    EmergencyPersistence::global().add_for_persistence(Arc::new(counter.clone()));
                }
            }
        }
    }

    fn get_or_create(&mut self, name: &str) -> &PersistentGCounter {
        match self.counters.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = self
                    .dirname
                    .join(format!("{name}.{COUNTER_FILE_EXTENSION}"));
                let counter = PersistentGCounter::with_sink_observer_and_name(
                    self.identity.clone(),
                    path,
                    Arc::new(ReplicatorSink {
                        mailbox: self.mailbox.clone(),
                    }),
                    self.observer.clone(),
                    name,
                );
                if self.persist_on_signal {
                    EmergencyPersistence::global().add_for_persistence(Arc::new(counter.clone()));
                }
                entry.insert(counter)
            }
        }
    }

    fn merge(&mut self, state: GCounterState) {
        let name = name_or_singleton(&state.name).to_string();
        self.get_or_create(&name).merge_with(state);
    }

    /// Fan-out of one counter's fresh snapshot to the whole cluster.
    async fn propagate(&mut self, state: GCounterState) {
        let message =
            NetworkMessage::g_counter(self.identity.clone(), state, self.discovery_metadata());
        let bytes = message.to_bytes();
        self.cluster.broadcast_message(bytes.clone());
        for peer in self.cluster.peers().await {
            self.cluster_observer.after_message_sent(&peer, &bytes);
        }
    }

    fn incoming(&mut self, transport_identity: String, message: Vec<u8>) {
        let envelope = match NetworkMessage::from_bytes(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "dropping undecodable message");
                return;
            }
        };
        let peer = if transport_identity.is_empty() {
            envelope.source_peer.clone()
        } else {
            transport_identity
        };
        match envelope.message_type.as_str() {
            GCOUNTER_MESSAGE => self.merge(envelope.state.clone()),
            PEER_OHAI_MESSAGE => self.dial_back(&envelope),
            PEER_HELLO_MESSAGE => {
                debug!(identity = %self.identity, source = %envelope.source_peer, "peer hello");
            }
            unknown => {
                warn!(identity = %self.identity, message_type = %unknown, "dropping message of unknown type");
            }
        }
        self.cluster_observer.after_message_received(&peer, &message);
    }

    /// Second half of the discovery handshake: a peer greeted us with its
    /// reachable address, so dial it and reply with a hello. Push sockets
    /// are unidirectional; without this exchange a NAT-crossed peer could
    /// receive our state but never send its own.
    fn dial_back(&mut self, envelope: &NetworkMessage) {
        let ip = envelope.metadata.get(METADATA_IP);
        let port = envelope.metadata.get(METADATA_TCP_PORT);
        match (ip, port) {
            (Some(ip), Some(port)) if !ip.is_empty() && !port.is_empty() => {
                let peer = format!("tcp://{ip}:{port}");
                info!(identity = %self.identity, source = %envelope.source_peer, peer = %peer, "discovered peer, dialing back");
                self.cluster.ensure_peer(&peer);
                let hello = NetworkMessage::peer_hello(self.identity.clone()).to_bytes();
                self.cluster.send_message_to_peer(&peer, hello.clone());
                self.cluster_observer.after_message_sent(&peer, &hello);
            }
            _ => {
                warn!(identity = %self.identity, source = %envelope.source_peer, "dropping greeting without address metadata");
            }
        }
    }

    /// Catch-up for a late joiner: one snapshot per owned counter.
    async fn send_all_counters_to(&mut self, peer: &str) {
        for counter in self.counters.values() {
            let state = counter.state().await;
            let message =
                NetworkMessage::g_counter(self.identity.clone(), state, self.discovery_metadata());
            let bytes = message.to_bytes();
            self.cluster.send_message_to_peer(peer, bytes.clone());
            self.cluster_observer.after_message_sent(peer, &bytes);
        }
    }

    async fn update_peers(&mut self, peers: Vec<String>) {
        self.cluster.update_peers(peers).await;
        let greeting =
            NetworkMessage::peer_ohai(self.identity.clone(), self.discovery_metadata()).to_bytes();
        self.cluster.broadcast_message(greeting.clone());
        for peer in self.cluster.peers().await {
            self.cluster_observer.after_message_sent(&peer, &greeting);
        }
    }

    fn load_all(&mut self) {
        let entries = match fs::read_dir(&self.dirname) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(identity = %self.identity, dir = %self.dirname.display(), error = %e, "cannot scan state directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(COUNTER_FILE_EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                let name = name.to_string();
                self.get_or_create(&name);
            }
        }
    }

    fn discovery_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (METADATA_IP.to_string(), self.cluster.my_ip()),
            (
                METADATA_TCP_PORT.to_string(),
                self.cluster.my_tcp_port().to_string(),
            ),
        ])
    }
}

fn name_or_singleton(name: &str) -> &str {
    if name.is_empty() {
        SINGLETON_NAME
    } else {
        name
    }
}
