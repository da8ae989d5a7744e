// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

//! # gcounter-cluster
//!
//! Eventually-consistent, monotonically-increasing counters replicated
//! across a small cluster of peers.
//!
//! Each replica increments locally without coordination; peers exchange
//! full counter snapshots over TCP and merge them by pointwise maximum, so
//! replicas converge regardless of message order, loss, or duplication.
//! Counters write through to local files and resume from them on restart.
//!
//! The layers, smallest first:
//!
//! - [`GCounterState`] / [`GCounter`]: the pure grow-only counter CRDT.
//! - [`AsyncGCounter`]: the counter behind a single-consumer actor mailbox.
//! - [`PersistentGCounter`]: the actor plus file write-through, a state
//!   sink and a value observer.
//! - [`TcpCluster`]: the cluster endpoint (bind/listen, per-peer outbound
//!   sockets, broadcast, unicast).
//! - [`MultiGCounter`]: a named map of persistent counters replicated
//!   through one endpoint, including the peer-discovery handshake.
//! - [`EmergencyPersistence`]: a process-wide registry that flushes all
//!   counters on SIGINT/SIGTERM.

pub mod async_counter;
pub mod cluster;
pub mod emergency;
pub mod envelope;
pub mod g_counter;
pub mod multi;
pub mod persistent;
pub mod state;
pub mod traits;

// Re-export core traits
pub use traits::{
    ClusterObserver, CountEvent, CounterError, CounterObserver, GCounterStateSink,
    GCounterStateSource, NoOpClusterObserver, NoOpCounterObserver, NoOpGCounterStateSink,
    Persistent,
};

// Re-export the component types
pub use async_counter::AsyncGCounter;
pub use cluster::{Cluster, ClusterListener, TcpCluster};
pub use emergency::EmergencyPersistence;
pub use envelope::NetworkMessage;
pub use g_counter::GCounter;
pub use multi::{MultiGCounter, COUNTER_FILE_EXTENSION};
pub use persistent::PersistentGCounter;
pub use state::GCounterState;
