//! Cluster Membership
//!
//! Peer [`Node`]s with their heartbeat and reconnect machinery, and the
//! [`ClusterManager`] that reconciles the node map against a membership
//! source and publishes [`ClusterEvent`]s.

pub mod events;
pub mod manager;
pub mod node;
pub mod signal;

pub use events::ClusterEvent;
pub use manager::{ClusterManager, ClusterStats, MembershipDiff, WatchState};
pub use node::{Node, NodeSnapshot, NodeStatus};
pub use signal::StopSignal;
