//! Cluster Integration Tests
//!
//! Manager, registry, nodes and listeners wired together over loopback
//! sockets. No mocks: every peer is a real listener.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use trellis_cluster::{
    ClusterEvent, ClusterManager, InMemoryRegistry, Listener, MessageRouter, NodeStatus,
    WatchState,
};
use trellis_config::{Addr, AppConfig, ClusterSettings};

const GROUP: &str = "shard-test";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings() -> ClusterSettings {
    ClusterSettings {
        pool_size: 2,
        dial_timeout_ms: 500,
        reconnect_delay_ms: 60_000,
        watch_wait_ms: 200,
        watch_retry_delay_ms: 50,
        ..Default::default()
    }
}

fn member(id: u16, port: u16) -> AppConfig {
    AppConfig::new(id, "shard", "test", Addr::new("127.0.0.1", port))
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn next_event(events: &mut broadcast::Receiver<ClusterEvent>) -> ClusterEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("timed out waiting for cluster event")
        .expect("event channel closed")
}

/// Collect events up to and including the next `ClusterChanged`
async fn events_until_changed(events: &mut broadcast::Receiver<ClusterEvent>) -> Vec<ClusterEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, ClusterEvent::ClusterChanged { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Remote member: a listener whose `(5, 1)` handler forwards payloads
async fn remote_member(
    id: u16,
) -> (AppConfig, Arc<Listener>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let router = Arc::new(MessageRouter::new());
    router.register(5, 1, move |payload| {
        tx.send(payload.to_vec())?;
        Ok(())
    });

    let listener = Listener::bind("127.0.0.1:0", router, &settings()).await.unwrap();
    let config = member(id, listener.local_addr().port());
    (config, listener, rx)
}

#[tokio::test]
async fn test_watch_connects_and_sends_to_registered_peer() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());

    let (remote, listener, mut received) = remote_member(2).await;
    let local = member(1, unused_port());
    registry.register_app(&remote);
    registry.register_app(&local);

    let manager = ClusterManager::new(local.clone(), settings(), registry.clone()).unwrap();
    let mut events = manager.subscribe();
    manager.watch_services(GROUP).unwrap();

    match next_event(&mut events).await {
        ClusterEvent::NodeAdded { service_id, config } => {
            assert_eq!(service_id, remote.service_id());
            assert_eq!(config, remote);
        }
        other => panic!("expected node_added, got {:?}", other),
    }

    assert!(wait_until(|| manager.state() == WatchState::Watching).await);
    assert_eq!(manager.node_count(), 1);
    assert!(manager.get_node(&local.service_id()).is_none());
    assert_eq!(manager.last_index(), registry.index());

    let node = manager.get_node(&remote.service_id()).unwrap();
    assert!(wait_until(|| node.status() == NodeStatus::Connected).await);

    node.send(5, 1, b"across the mesh".to_vec()).await.unwrap();
    let payload = timeout(Duration::from_secs(2), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, b"across the mesh".to_vec());

    manager.close().await;
    assert_eq!(node.status(), NodeStatus::Disconnected);
    listener.shutdown().await;
}

#[tokio::test]
async fn test_membership_changes_publish_events() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let manager = ClusterManager::new(member(1, unused_port()), settings(), registry.clone()).unwrap();
    let mut events = manager.subscribe();

    manager.watch_services(GROUP).unwrap();
    assert!(wait_until(|| manager.state() == WatchState::Watching).await);
    assert_eq!(manager.node_count(), 0);

    // Nothing listens on this port; the node stays failed but is tracked
    let peer = member(3, unused_port());
    let peer_id = peer.service_id();

    registry.register_app(&peer);
    let added = events_until_changed(&mut events).await;
    assert!(added.iter().any(|e| matches!(e, ClusterEvent::NodeAdded { service_id, .. } if *service_id == peer_id)));
    match added.last() {
        Some(ClusterEvent::ClusterChanged { total, added, updated, removed }) => {
            assert_eq!(*total, 1);
            assert_eq!(added, &vec![peer_id.clone()]);
            assert!(updated.is_empty() && removed.is_empty());
        }
        other => panic!("expected cluster_changed, got {:?}", other),
    }

    let moved = peer.clone().with_data("zone", serde_json::json!("b"));
    registry.register_app(&moved);
    let updated = events_until_changed(&mut events).await;
    assert!(updated.iter().any(|e| matches!(
        e,
        ClusterEvent::NodeUpdated { previous, current, .. } if previous == &peer && current == &moved
    )));
    assert_eq!(manager.get_node(&peer_id).unwrap().config(), moved);

    assert!(registry.deregister(&peer.service_name(), &peer_id));
    let removed = events_until_changed(&mut events).await;
    assert!(removed.iter().any(|e| matches!(e, ClusterEvent::NodeRemoved { service_id } if *service_id == peer_id)));
    assert_eq!(manager.node_count(), 0);

    manager.close().await;
}

#[tokio::test]
async fn test_unchanged_registration_publishes_nothing() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let peer = member(4, unused_port());
    registry.register_app(&peer);

    let manager = ClusterManager::new(member(1, unused_port()), settings(), registry.clone()).unwrap();
    manager.watch_services(GROUP).unwrap();
    assert!(wait_until(|| manager.state() == WatchState::Watching).await);
    let mut events = manager.subscribe();

    // Index advances but metadata is identical
    registry.register_app(&peer);
    assert!(wait_until(|| manager.last_index() == registry.index()).await);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    manager.close().await;
}

#[tokio::test]
async fn test_source_failures_are_retried() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    let peer = member(5, unused_port());
    registry.register_app(&peer);
    registry.fail_next(2);

    let manager = ClusterManager::new(member(1, unused_port()), settings(), registry.clone()).unwrap();
    manager.watch_services(GROUP).unwrap();

    assert!(wait_until(|| manager.state() == WatchState::Watching).await);
    assert!(manager.get_node(&peer.service_id()).is_some());

    manager.close().await;
}

#[tokio::test]
async fn test_close_stops_watch_and_publishes_closed() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register_app(&member(6, unused_port()));

    let manager = ClusterManager::new(member(1, unused_port()), settings(), registry.clone()).unwrap();
    manager.watch_services(GROUP).unwrap();
    assert!(wait_until(|| manager.node_count() == 1).await);

    let mut events = manager.subscribe();
    manager.close().await;
    manager.close().await;

    assert!(matches!(next_event(&mut events).await, ClusterEvent::ClusterClosed));
    assert_eq!(manager.state(), WatchState::Stopped);
    assert_eq!(manager.node_count(), 0);
    assert!(manager.watch_services(GROUP).is_err());

    let stats = manager.stats();
    assert_eq!(stats.total_nodes, 0);
    assert_eq!(stats.state, WatchState::Stopped);
}
