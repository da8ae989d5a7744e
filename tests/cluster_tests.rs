// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use gcounter_cluster::{CountEvent, MultiGCounter, TcpCluster};

mod common;
use common::{TestClusterObserver, TestCounterObserver};

const NAME1: &str = "name1";
const NAME2: &str = "name2";

#[tokio::test(flavor = "multi_thread")]
async fn test_exchanging_state_changes() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let (bind1, peer1) = common::next_bind_url();
    let (bind2, peer2) = common::next_bind_url();

    let observer = Arc::new(TestCounterObserver::new());
    let c1 = MultiGCounter::observable("1", dir1.path(), bind1, observer.clone());
    assert!(c1.start().await.is_ok());
    // no repeated starts
    assert!(c1.start().await.is_err());
    c1.increment(NAME1);
    common::wait_for_value_of(1, || c1.value(NAME1)).await;

    let c2 = MultiGCounter::new("2", dir2.path(), bind2);
    assert!(c2.start().await.is_ok());

    // upon c1 discovering a new peer, c2 should merge from c1
    c1.update_peers(vec![peer2]).await;
    common::wait_for_value_of(1, || c2.value(NAME1)).await;

    // until now, only the first 2 values should have been observed
    assert_eq!(
        observer.events(),
        vec![
            CountEvent {
                name: NAME1.to_string(),
                count: 0
            },
            CountEvent {
                name: NAME1.to_string(),
                count: 1
            },
        ]
    );

    // bidirectional connection
    c2.update_peers(vec![peer1]).await;
    common::wait_for_value_of(1, || c1.value(NAME1)).await;

    // incrementing c2 should cause c1 to converge on the same value
    c2.increment(NAME1);
    common::wait_for_value_of(2, || c1.value(NAME1)).await;
    common::wait_for_value_of(2, || c2.value(NAME1)).await;

    // wait for persistence before deletion
    c1.persist_sync().await;
    c2.persist_sync().await;

    // now all should have been observed
    assert_eq!(
        observer.events(),
        vec![
            CountEvent {
                name: NAME1.to_string(),
                count: 0
            },
            CountEvent {
                name: NAME1.to_string(),
                count: 1
            },
            CountEvent {
                name: NAME1.to_string(),
                count: 2
            },
        ]
    );

    c1.stop().await;
    c2.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stopping_and_rebinding_the_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (bind, _) = common::next_bind_url();

    let c1 = MultiGCounter::new("1", dir.path(), bind.clone());
    assert!(c1.start().await.is_ok());
    c1.persist_sync().await;
    c1.stop().await;
    // stop is idempotent
    c1.stop().await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let c2 = MultiGCounter::new("1", dir.path(), bind);
    assert!(c2.start().await.is_ok());
    c2.persist_sync().await;
    c2.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_creating_the_state_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("test-dir/counters");
    let (bind, _) = common::next_bind_url();

    let c1 = MultiGCounter::new("1", &nested, bind);
    assert!(c1.start().await.is_ok());
    c1.increment(NAME1);
    c1.increment(NAME1);
    c1.increment(NAME2);
    common::wait_for_value_of(2, || c1.value(NAME1)).await;
    common::wait_for_value_of(1, || c1.value(NAME2)).await;
    c1.persist_sync().await;
    assert!(nested.join("name1.gcounter").exists());
    assert!(nested.join("name2.gcounter").exists());
    c1.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reopening_the_files() {
    let dir = tempfile::tempdir().unwrap();
    let (bind, _) = common::next_bind_url();
    {
        let c1 = MultiGCounter::new("1", dir.path(), bind.clone());
        assert!(c1.start().await.is_ok());
        c1.increment(NAME1);
        c1.increment(NAME1);
        c1.increment(NAME2);
        common::wait_for_value_of(2, || c1.value(NAME1)).await;
        common::wait_for_value_of(1, || c1.value(NAME2)).await;
        c1.persist_sync().await;
        c1.stop().await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let c1 = MultiGCounter::new("1", dir.path(), bind);
    assert!(c1.start().await.is_ok());
    c1.increment(NAME2);
    common::wait_for_value_of(2, || c1.value(NAME1)).await;
    common::wait_for_value_of(2, || c1.value(NAME2)).await;
    c1.persist_sync().await;
    c1.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multiple_counters() {
    let dir = tempfile::tempdir().unwrap();
    let (bind, _) = common::next_bind_url();
    let observer = Arc::new(TestCounterObserver::new());
    let c = MultiGCounter::observable("1", dir.path(), bind, observer.clone());
    assert!(c.start().await.is_ok());

    c.increment(NAME1);
    c.increment(NAME2);
    c.increment(NAME1);
    common::wait_for_value_of(2, || c.value(NAME1)).await;
    common::wait_for_value_of(1, || c.value(NAME2)).await;

    let mut events = observer.events();
    events.sort_by(|a, b| (&a.name, a.count).cmp(&(&b.name, b.count)));
    assert_eq!(
        events,
        vec![
            CountEvent {
                name: NAME1.to_string(),
                count: 0
            },
            CountEvent {
                name: NAME1.to_string(),
                count: 1
            },
            CountEvent {
                name: NAME1.to_string(),
                count: 2
            },
            CountEvent {
                name: NAME2.to_string(),
                count: 0
            },
            CountEvent {
                name: NAME2.to_string(),
                count: 1
            },
        ]
    );

    c.persist_sync().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_all_seeds_the_observer() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (bind, _) = common::next_bind_url();
        let c = MultiGCounter::new("1", dir.path(), bind);
        c.increment(NAME1);
        c.increment(NAME1);
        c.increment(NAME2);
        common::wait_for_value_of(2, || c.value(NAME1)).await;
        common::wait_for_value_of(1, || c.value(NAME2)).await;
        c.persist_sync().await;
        c.stop().await;
    }

    let (bind, _) = common::next_bind_url();
    let observer = Arc::new(TestCounterObserver::new());
    let c = MultiGCounter::observable("1", dir.path(), bind, observer.clone());
    c.load_all_sync().await;

    let mut events = observer.events();
    events.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(
        events,
        vec![
            CountEvent {
                name: NAME1.to_string(),
                count: 2
            },
            CountEvent {
                name: NAME2.to_string(),
                count: 1
            },
        ]
    );
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_discovery_handshake() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let (bind1, _) = common::next_bind_url();
    let (bind2, peer2) = common::next_bind_url();

    let c1 = MultiGCounter::new("1", dir1.path(), bind1);
    let c2 = MultiGCounter::new("2", dir2.path(), bind2);
    assert!(c1.start().await.is_ok());
    assert!(c2.start().await.is_ok());

    // only c1 declares a peer; c2 learns c1's address from the greeting
    // and dials back on its own
    c1.update_peers(vec![peer2]).await;

    c2.increment(NAME1);
    common::wait_for_value_of(1, || c1.value(NAME1)).await;

    c1.increment(NAME1);
    common::wait_for_value_of(2, || c2.value(NAME1)).await;

    c1.stop().await;
    c2.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_observer_traffic() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let (bind1, _) = common::next_bind_url();
    let (bind2, peer2) = common::next_bind_url();

    let cluster_observer = Arc::new(TestClusterObserver::new());
    let cluster = Arc::new(TcpCluster::new("1", bind1));
    let c1 = MultiGCounter::with_observers(
        "1",
        dir1.path(),
        cluster,
        Arc::new(TestCounterObserver::new()),
        cluster_observer.clone(),
    );
    let c2 = MultiGCounter::new("2", dir2.path(), bind2);
    assert!(c1.start().await.is_ok());
    assert!(c2.start().await.is_ok());

    c1.update_peers(vec![peer2.clone()]).await;
    c1.increment(NAME1);
    common::wait_for_value_of(1, || c2.value(NAME1)).await;

    let sent = cluster_observer.messages_sent();
    assert!(!sent.is_empty());
    assert!(sent.iter().all(|event| event.peer == peer2));

    // c2 dials back after the greeting and pushes its counters, so c1
    // records received traffic attributed to c2's replica identity
    let received = cluster_observer.wait_for_any_received().await;
    assert!(received.iter().any(|event| event.peer == "2"));

    c1.stop().await;
    c2.stop().await;
}

async fn send_raw_frame(addr: &str, payload: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
    // keep the connection open long enough for the frame to be read
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wire_format_and_unknown_message_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let (bind, peer) = common::next_bind_url();
    let addr = peer.strip_prefix("tcp://").unwrap().to_string();

    let c = MultiGCounter::new("1", dir.path(), bind);
    assert!(c.start().await.is_ok());

    // an unknown type is logged and dropped without poisoning the loop
    send_raw_frame(&addr, br#"{"type":"mystery.network.message","source_peer":"9"}"#).await;

    // a counter snapshot for an unseen name silently creates it
    send_raw_frame(
        &addr,
        br#"{"type":"g-counter.network.message","source_peer":"9","name":"remote-only","peers":{"9":5}}"#,
    )
    .await;
    common::wait_for_value_of(5, || c.value("remote-only")).await;

    // a snapshot without a name resolves to the singleton counter
    send_raw_frame(
        &addr,
        br#"{"type":"g-counter.network.message","source_peer":"9","peers":{"9":2}}"#,
    )
    .await;
    common::wait_for_value_of(2, || c.value("singleton")).await;

    c.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_counter_handle() {
    let dir = tempfile::tempdir().unwrap();
    let (bind, _) = common::next_bind_url();
    let c = MultiGCounter::new("1", dir.path(), bind);

    let counter = c.get_counter(NAME1).await.unwrap();
    counter.increment();
    common::wait_for_value_of(1, || c.value(NAME1)).await;

    c.persist_one_sync(NAME1).await;
    assert!(dir.path().join("name1.gcounter").exists());
    c.stop().await;
}
