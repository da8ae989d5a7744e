// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use crate::state::GCounterState;
use crate::traits::GCounterStateSource;

/// G-Counter: a grow-only counter owned by one replica.
///
/// Pairs a replica identity with a [`GCounterState`]. `increment` bumps the
/// tally of the owning replica only; tallies of other replicas change solely
/// through merges, which take the pointwise maximum per replica.
///
/// This is the plain, single-threaded core. Wrap it in an
/// [`AsyncGCounter`](crate::AsyncGCounter) or a
/// [`PersistentGCounter`](crate::PersistentGCounter) for concurrent use.
///
/// # Example
///
/// ```
/// use gcounter_cluster::GCounter;
///
/// let mut c = GCounter::new("replica-1");
/// c.increment();
/// c.increment();
/// assert_eq!(c.value(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct GCounter {
    identity: String,
    state: GCounterState,
}

impl GCounter {
    /// Creates a counter with an empty state.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: GCounterState::new(),
        }
    }

    /// Creates a counter resuming from a previously captured state.
    pub fn from_state(identity: impl Into<String>, state: GCounterState) -> Self {
        Self {
            identity: identity.into(),
            state,
        }
    }

    /// The identity of the owning replica.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The logical counter name.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.state.name = name.into();
    }

    /// Increments this replica's own tally by one.
    pub fn increment(&mut self) {
        self.state.increment_tally(&self.identity);
    }

    /// Returns the counter total across all replicas.
    pub fn value(&self) -> i64 {
        self.state.value()
    }

    /// Merges a remote state into this counter.
    pub fn merge_with(&mut self, other: &GCounterState) {
        self.state.merge(other);
    }

    /// Borrow the interior state.
    pub fn state(&self) -> &GCounterState {
        &self.state
    }
}

impl GCounterStateSource for GCounter {
    fn get_state(&self) -> GCounterState {
        self.state.clone()
    }
}
