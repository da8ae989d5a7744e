// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use thiserror::Error;

use crate::state::GCounterState;

/// Error type for counter and cluster operations
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Endpoint already started")]
    AlreadyStarted,
    #[error("Endpoint stopped")]
    Stopped,
    #[error("Bind error: {0}")]
    Bind(String),
    #[error("Envelope error: {0}")]
    Envelope(String),
}

/// Read access to a counter's replicated state.
///
/// Implementors hand out an owned deep copy; callers never observe later
/// mutations through the returned value.
pub trait GCounterStateSource {
    fn get_state(&self) -> GCounterState;
}

/// Consumer of state snapshots, called after every mutation of a counter.
///
/// `set_state` must not block: implementors enqueue the snapshot into their
/// own mailbox and return.
pub trait GCounterStateSink: Send + Sync {
    fn set_state(&self, state: GCounterState);
}

/// A change of a counter's total, as delivered to a [`CounterObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountEvent {
    pub name: String,
    pub count: i64,
}

/// Observer of counter totals.
///
/// Invoked once with the starting value when a persistent counter is
/// constructed, and afterwards only when the total actually changes. A merge
/// that leaves the total untouched produces no event.
pub trait CounterObserver: Send + Sync {
    fn on_new_count(&self, event: CountEvent);
}

/// Observer of cluster traffic, for tests and on-wire tracing.
///
/// No ordering is guaranteed between sent and received notifications.
pub trait ClusterObserver: Send + Sync {
    fn after_message_sent(&self, peer: &str, message: &[u8]);
    fn after_message_received(&self, peer: &str, message: &[u8]);
}

/// Anything that can be flushed to durable storage on demand.
#[async_trait]
pub trait Persistent: Send + Sync {
    async fn persist_sync(&self);
}

/// State sink that discards all snapshots.
#[derive(Debug, Default)]
pub struct NoOpGCounterStateSink;

impl GCounterStateSink for NoOpGCounterStateSink {
    fn set_state(&self, _state: GCounterState) {}
}

/// Observer that ignores all count events.
#[derive(Debug, Default)]
pub struct NoOpCounterObserver;

impl CounterObserver for NoOpCounterObserver {
    fn on_new_count(&self, _event: CountEvent) {}
}

/// Observer that ignores all cluster traffic.
#[derive(Debug, Default)]
pub struct NoOpClusterObserver;

impl ClusterObserver for NoOpClusterObserver {
    fn after_message_sent(&self, _peer: &str, _message: &[u8]) {}
    fn after_message_received(&self, _peer: &str, _message: &[u8]) {}
}
