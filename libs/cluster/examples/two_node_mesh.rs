//! Two-member mesh over loopback
//!
//! Starts two members that share an in-process registry. Each member runs a
//! listener, registers itself and watches the group; once both see each
//! other, every member greets its peer over the pooled connections. The
//! peer's listener echoes each greeting back on the same route, so every
//! member also logs its own greeting once it returns.
//!
//! Run with `RUST_LOG=trellis_cluster=debug` to follow heartbeats and
//! membership diffs.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;
use trellis_cluster::{
    ClusterEvent, ClusterManager, InMemoryRegistry, Listener, MessageRouter, NodeStatus,
};
use trellis_config::{Addr, AppConfig, ClusterSettings};

const GREETING_MODULE: u32 = 10;
const GREETING_CMD: u32 = 1;

struct Member {
    manager: Arc<ClusterManager>,
    listener: Arc<Listener>,
}

async fn start_member(
    id: u16,
    registry: Arc<InMemoryRegistry>,
    settings: &ClusterSettings,
) -> anyhow::Result<Member> {
    let router = Arc::new(MessageRouter::new());
    router.register(GREETING_MODULE, GREETING_CMD, move |payload| {
        info!(member = id, greeting = %String::from_utf8_lossy(payload), "Greeting received");
        Ok(())
    });

    let listener = Listener::bind("127.0.0.1:0", router.clone(), settings).await?;
    let app = AppConfig::new(id, "mesh", "demo", Addr::new("127.0.0.1", listener.local_addr().port()));
    registry.register_app(&app);

    let manager = ClusterManager::with_router(app.clone(), settings.clone(), registry, router)?;
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClusterEvent::ClusterClosed = event {
                break;
            }
            info!(member = id, event = %serde_json::to_string(&event).unwrap_or_default(), "Cluster event");
        }
    });
    manager.watch_services(&app.service_name())?;

    Ok(Member { manager, listener })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = ClusterSettings {
        pool_size: 2,
        heartbeat_interval_ms: 1_000,
        watch_wait_ms: 1_000,
        ..Default::default()
    };
    settings.validate()?;

    let registry = Arc::new(InMemoryRegistry::new());
    let members = vec![
        start_member(1, registry.clone(), &settings).await?,
        start_member(2, registry.clone(), &settings).await?,
    ];

    // Wait until each member has a connected node for its peer
    for _ in 0..100 {
        let ready = members.iter().all(|member| {
            let nodes = member.manager.get_all_nodes();
            nodes.len() == 1 && nodes[0].status() == NodeStatus::Connected
        });
        if ready {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for member in &members {
        for node in member.manager.get_all_nodes() {
            let greeting = format!("hello from {}", member.manager.local_service_id());
            let session_id = node.send(GREETING_MODULE, GREETING_CMD, greeting.into_bytes()).await?;
            info!(to = %node.service_id(), session_id = %session_id, "Greeting sent");
        }
        info!(stats = %serde_json::to_string(&member.manager.stats())?, "Member view");
    }

    // Let a few heartbeats go by
    tokio::time::sleep(Duration::from_secs(3)).await;

    for member in members {
        member.manager.close().await;
        member.listener.shutdown().await;
    }
    Ok(())
}
