// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use gcounter_cluster::{ClusterObserver, CountEvent, CounterObserver, GCounterStateSink, GCounterState};

/// Polls an async value getter until it returns the expected value,
/// asserting on timeout. Replication is eventually consistent, so tests
/// wait instead of assuming delivery latencies.
pub async fn wait_for_value_of<F, Fut>(expected: i64, value: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = i64>,
{
    for _ in 0..50 {
        if value().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(expected, value().await);
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(46100);

/// A fresh TCP port per call so parallel tests never contend for a bind.
pub fn next_bind_url() -> (String, String) {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    (format!("tcp://:{port}"), format!("tcp://localhost:{port}"))
}

#[derive(Default)]
pub struct TestCounterObserver {
    events: Mutex<Vec<CountEvent>>,
}

impl TestCounterObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CountEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until the observer has seen the expected number of events,
    /// asserting on timeout.
    pub async fn wait_for_events(&self, expected: usize) -> Vec<CountEvent> {
        for _ in 0..50 {
            let events = self.events();
            if events.len() == expected {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let events = self.events();
        assert_eq!(expected, events.len(), "events seen: {events:?}");
        events
    }
}

impl CounterObserver for TestCounterObserver {
    fn on_new_count(&self, event: CountEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub peer: String,
    pub message: Vec<u8>,
}

#[derive(Default)]
pub struct TestClusterObserver {
    sent: Mutex<Vec<MessageEvent>>,
    received: Mutex<Vec<MessageEvent>>,
}

impl TestClusterObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_sent(&self) -> Vec<MessageEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn messages_received(&self) -> Vec<MessageEvent> {
        self.received.lock().unwrap().clone()
    }

    pub async fn wait_for_any_received(&self) -> Vec<MessageEvent> {
        for _ in 0..50 {
            let received = self.messages_received();
            if !received.is_empty() {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let received = self.messages_received();
        assert!(!received.is_empty(), "no messages received");
        received
    }
}

impl ClusterObserver for TestClusterObserver {
    fn after_message_sent(&self, peer: &str, message: &[u8]) {
        self.sent.lock().unwrap().push(MessageEvent {
            peer: peer.to_string(),
            message: message.to_vec(),
        });
    }

    fn after_message_received(&self, peer: &str, message: &[u8]) {
        self.received.lock().unwrap().push(MessageEvent {
            peer: peer.to_string(),
            message: message.to_vec(),
        });
    }
}

#[derive(Default)]
pub struct TestStateSink {
    states: Mutex<Vec<GCounterState>>,
}

impl TestStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_state(&self) -> Option<GCounterState> {
        self.states.lock().unwrap().last().cloned()
    }
}

impl GCounterStateSink for TestStateSink {
    fn set_state(&self, state: GCounterState) {
        self.states.lock().unwrap().push(state);
    }
}
