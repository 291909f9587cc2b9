//! # Trellis Cluster
//!
//! Peer-to-peer transport and membership for a mesh of services.
//!
//! ## Module Boundaries
//!
//! - [`transports`]: dialing, framed socket I/O, the per-peer
//!   [`ConnectionPool`] and the inbound [`Listener`]
//! - [`routing`]: `(module, cmd)` handler table shared by listeners and nodes
//! - [`cluster`]: peer [`Node`]s (heartbeat, reconnect) and the
//!   [`ClusterManager`] that reconciles them against membership
//! - [`discovery`]: the [`MembershipSource`] seam, instance metadata parsing
//!   and an in-process registry
//!
//! ## Data Flow
//!
//! ```text
//! MembershipSource ──watch──► ClusterManager ──add/update/remove──► Node
//!                                   │                               │
//!                              ClusterEvent                   ConnectionPool ──► remote Listener
//!                                                                   │                    │
//!                                                              receive loop        MessageRouter
//! ```

pub mod cluster;
pub mod discovery;
pub mod error;
pub mod routing;
pub mod transports;

pub use error::{ClusterError, Result};

pub use cluster::{
    ClusterEvent, ClusterManager, ClusterStats, MembershipDiff, Node, NodeSnapshot, NodeStatus,
    StopSignal, WatchState,
};
pub use discovery::{
    HealthyInstances, InMemoryRegistry, MembershipSource, MetadataError, ServiceInstance,
};
pub use routing::{route_key, MessageHandler, MessageRouter};
pub use transports::{ConnectionPool, Listener, PooledConnection, DEFAULT_POOL_SIZE};

// Wire types used at this crate's surface
pub use trellis_codec::{Frame, RequestFrame, ResponseFrame};
