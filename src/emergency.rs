// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::info;

use crate::traits::Persistent;

static GLOBAL: OnceLock<EmergencyPersistence> = OnceLock::new();

/// Process-wide registry of counters to flush when the process is told to
/// terminate.
///
/// Counters register through [`add_for_persistence`]; a call to
/// [`persist_and_exit_on_signal`] then parks until SIGINT or SIGTERM
/// arrives, serially flushes every registrant, and exits with code 0.
/// Valid with zero registrants, in which case it only waits and exits.
///
/// [`add_for_persistence`]: EmergencyPersistence::add_for_persistence
/// [`persist_and_exit_on_signal`]: EmergencyPersistence::persist_and_exit_on_signal
pub struct EmergencyPersistence {
    registrants: Mutex<Vec<Arc<dyn Persistent>>>,
}

impl EmergencyPersistence {
    /// The process-wide registry, created lazily on first use.
    pub fn global() -> &'static EmergencyPersistence {
        GLOBAL.get_or_init(|| EmergencyPersistence {
            registrants: Mutex::new(Vec::new()),
        })
    }

    /// Registers one more flushable endpoint.
    pub fn add_for_persistence(&self, persistent: Arc<dyn Persistent>) {
        self.registrants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(persistent);
    }

    /// Parks until a termination signal arrives, flushes every registrant,
    /// and exits the process with code 0.
    pub async fn persist_and_exit_on_signal(&self) {
        wait_for_termination_signal().await;
        info!("received termination signal, persisting");
        let registrants: Vec<Arc<dyn Persistent>> = self
            .registrants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for persistent in registrants {
            persistent.persist_sync().await;
        }
        info!("exiting");
        std::process::exit(0);
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
