// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::g_counter::GCounter;
use crate::state::GCounterState;
use crate::traits::{
    CountEvent, CounterObserver, GCounterStateSink, NoOpCounterObserver, NoOpGCounterStateSink,
    Persistent,
};

enum Command {
    Increment,
    Value(oneshot::Sender<i64>),
    GetState(oneshot::Sender<GCounterState>),
    MergeWith(GCounterState),
    Persist,
    PersistSync(oneshot::Sender<()>),
}

/// A G-Counter actor with write-through persistence.
///
/// Extends the plain actor-wrapped counter with a backing file, a state sink
/// and a value observer. The state is loaded eagerly on construction: a
/// missing, empty or unparseable file degrades to an empty state whose name
/// defaults to the file's base name. The observer is seeded exactly once
/// with the starting value, so downstream consumers can reconcile.
///
/// Every mutation turn runs atomically inside the mailbox: apply the change,
/// emit an observer event iff the total changed, forward a state snapshot to
/// the sink, and enqueue a persist turn. `persist_sync` instead writes
/// inline and suspends the caller until the file write completed.
///
/// Serialization and file-write failures indicate a broken setup and abort
/// the process; read failures during load are logged and recovered from.
///
/// Must be constructed inside a Tokio runtime.
#[derive(Clone)]
pub struct PersistentGCounter {
    mailbox: mpsc::UnboundedSender<Command>,
}

impl PersistentGCounter {
    pub fn new(identity: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::with_sink(identity, path, Arc::new(NoOpGCounterStateSink))
    }

    pub fn with_sink(
        identity: impl Into<String>,
        path: impl Into<PathBuf>,
        sink: Arc<dyn GCounterStateSink>,
    ) -> Self {
        Self::with_sink_and_observer(identity, path, sink, Arc::new(NoOpCounterObserver))
    }

    pub fn with_sink_and_observer(
        identity: impl Into<String>,
        path: impl Into<PathBuf>,
        sink: Arc<dyn GCounterStateSink>,
        observer: Arc<dyn CounterObserver>,
    ) -> Self {
        Self::spawn(identity.into(), path.into(), sink, observer, None)
    }

    /// Constructor for the multi-counter case: the caller-supplied name
    /// overrides whatever name the file carried.
    pub(crate) fn with_sink_observer_and_name(
        identity: impl Into<String>,
        path: impl Into<PathBuf>,
        sink: Arc<dyn GCounterStateSink>,
        observer: Arc<dyn CounterObserver>,
        name: &str,
    ) -> Self {
        Self::spawn(
            identity.into(),
            path.into(),
            sink,
            observer,
            Some(name.to_string()),
        )
    }

    fn spawn(
        identity: String,
        path: PathBuf,
        sink: Arc<dyn GCounterStateSink>,
        observer: Arc<dyn CounterObserver>,
        name_override: Option<String>,
    ) -> Self {
        let mut state = load_state(&path);
        if let Some(name) = name_override {
            state.name = name;
        }
        let inner = GCounter::from_state(identity, state);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut actor = CounterActor {
            inner,
            path,
            sink,
            observer,
            last_observed: 0,
            mailbox: tx.clone(),
        };
        actor.seed_observer();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                actor.handle(command);
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

    /// Writes the state to disk and suspends until the write completed.
    pub async fn persist_sync(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.mailbox.send(Command::PersistSync(tx));
        let _ = rx.await;
    }
}

#[async_trait]
impl Persistent for PersistentGCounter {
    async fn persist_sync(&self) {
        PersistentGCounter::persist_sync(self).await;
    }
}

struct CounterActor {
    inner: GCounter,
    path: PathBuf,
    sink: Arc<dyn GCounterStateSink>,
    observer: Arc<dyn CounterObserver>,
    last_observed: i64,
    mailbox: mpsc::UnboundedSender<Command>,
}

impl CounterActor {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Increment => self.mutate(|inner| inner.increment()),
            Command::MergeWith(state) => self.mutate(|inner| inner.merge_with(&state)),
            Command::Value(reply) => {
                let _ = reply.send(self.inner.value());
            }
            Command::GetState(reply) => {
                let _ = reply.send(self.inner.state().clone());
            }
            Command::Persist => self.persist_now(),
            Command::PersistSync(reply) => {
                self.persist_now();
                let _ = reply.send(());
            }
        }
    }

    /// The atomic mutation turn: apply, observe iff changed, fan out, and
    /// schedule the file write as its own turn.
    fn mutate(&mut self, apply: impl FnOnce(&mut GCounter)) {
        apply(&mut self.inner);
        let value = self.inner.value();
        if value != self.last_observed {
            self.last_observed = value;
            self.observer.on_new_count(CountEvent {
                name: self.inner.name().to_string(),
                count: value,
            });
        }
        self.sink.set_state(self.inner.state().clone());
        let _ = self.mailbox.send(Command::Persist);
    }

    fn seed_observer(&mut self) {
        self.last_observed = self.inner.value();
        self.observer.on_new_count(CountEvent {
            name: self.inner.name().to_string(),
            count: self.last_observed,
        });
    }

    fn persist_now(&self) {
        let bytes = match serde_json::to_vec(self.inner.state()) {
            Ok(bytes) => bytes,
            Err(e) => panic!(
                "cannot serialize counter state for {}: {e}",
                self.path.display()
            ),
        };
        // Write-to-temp-and-rename keeps a crashed write from truncating the
        // previous snapshot.
        let tmp = self.path.with_extension("gcounter.tmp");
        let written = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            panic!(
                "cannot persist counter state to {}: {e}",
                self.path.display()
            );
        }
        debug!(path = %self.path.display(), "persisted counter state");
    }
}

/// Loads a state file, degrading to an empty state on any read or parse
/// problem. An empty stored name defaults to the file's base name.
fn load_state(path: &Path) -> GCounterState {
    let default_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let state = match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => GCounterState::new(),
        Ok(bytes) => match serde_json::from_slice::<GCounterState>(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable counter state, starting empty");
                GCounterState::new()
            }
        },
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no counter state to load, starting empty");
            GCounterState::new()
        }
    };
    state.with_default_name(&default_name)
}
