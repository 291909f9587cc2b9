//! Cluster membership events
//!
//! Published by the manager on a broadcast channel. Publishing with no
//! subscribers is not an error; slow subscribers observe `Lagged` and skip
//! ahead.

use serde::Serialize;
use trellis_config::AppConfig;

/// Change to the local view of the cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    NodeAdded {
        service_id: String,
        config: AppConfig,
    },
    NodeUpdated {
        service_id: String,
        previous: AppConfig,
        current: AppConfig,
    },
    NodeRemoved {
        service_id: String,
    },
    /// Summary of one applied membership diff with at least one change
    ClusterChanged {
        total: usize,
        added: Vec<String>,
        updated: Vec<String>,
        removed: Vec<String>,
    },
    ClusterClosed,
}

impl ClusterEvent {
    /// Service id the event concerns, if it is about a single node
    pub fn service_id(&self) -> Option<&str> {
        match self {
            ClusterEvent::NodeAdded { service_id, .. }
            | ClusterEvent::NodeUpdated { service_id, .. }
            | ClusterEvent::NodeRemoved { service_id } => Some(service_id),
            ClusterEvent::ClusterChanged { .. } | ClusterEvent::ClusterClosed => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::NodeAdded { .. } => "node_added",
            ClusterEvent::NodeUpdated { .. } => "node_updated",
            ClusterEvent::NodeRemoved { .. } => "node_removed",
            ClusterEvent::ClusterChanged { .. } => "cluster_changed",
            ClusterEvent::ClusterClosed => "cluster_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag() {
        let value = serde_json::to_value(ClusterEvent::NodeRemoved {
            service_id: "a-b-1".to_string(),
        })
        .unwrap();
        assert_eq!(value["event"], "node_removed");
        assert_eq!(value["service_id"], "a-b-1");
    }

    #[test]
    fn test_service_id_accessor() {
        assert_eq!(ClusterEvent::ClusterClosed.service_id(), None);
        assert_eq!(
            ClusterEvent::NodeRemoved {
                service_id: "x".into()
            }
            .service_id(),
            Some("x")
        );
    }
}
