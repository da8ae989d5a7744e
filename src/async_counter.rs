// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use tokio::sync::{mpsc, oneshot};

use crate::g_counter::GCounter;
use crate::state::GCounterState;

enum Command {
    Increment,
    Value(oneshot::Sender<i64>),
    GetState(oneshot::Sender<GCounterState>),
    MergeWith(GCounterState),
}

/// Actor-wrapped G-Counter.
///
/// A cloneable handle over a single-consumer mailbox: one dedicated task
/// owns the [`GCounter`] and processes commands strictly in enqueue order.
/// Mutations (`increment`, `merge_with`) are fire-and-forget; queries
/// (`value`, `state`) suspend the caller until their turn completes and
/// return a copied-out value, so a caller always observes its own earlier
/// mutations. The interior state is never handed out by reference.
///
/// Must be constructed inside a Tokio runtime.
#[derive(Clone)]
pub struct AsyncGCounter {
    mailbox: mpsc::UnboundedSender<Command>,
}

impl AsyncGCounter {
    pub fn new(identity: impl Into<String>) -> Self {
        Self::from_counter(GCounter::new(identity))
    }

    /// Wraps an existing counter, taking exclusive ownership of it.
    pub fn from_counter(mut inner: GCounter) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Increment => inner.increment(),
                    Command::Value(reply) => {
                        let _ = reply.send(inner.value());
                    }
                    Command::GetState(reply) => {
                        let _ = reply.send(inner.state().clone());
                    }
                    Command::MergeWith(state) => inner.merge_with(&state),
                }
            }
        });
        Self { mailbox: tx }
    }

    /// Enqueues an increment of this replica's tally.
    pub fn increment(&self) {
        let _ = self.mailbox.send(Command::Increment);
    }

    /// Enqueues a merge with a remote state snapshot.
    pub fn merge_with(&self, state: GCounterState) {
        let _ = self.mailbox.send(Command::MergeWith(state));
    }

    /// Returns the counter total, observing all previously enqueued mutations.
    pub async fn value(&self) -> i64 {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(Command::Value(tx));
        rx.await.unwrap_or_default()
    }

    /// Returns a deep copy of the current state.
    pub async fn state(&self) -> GCounterState {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(Command::GetState(tx));
        rx.await.unwrap_or_default()
    }
}
