//! Cluster Error Types
//!
//! Error handling for peer transport, dispatch and membership failures.
//! Each variant falls into one of the categories the node and manager act
//! on: transport failures trigger reconnects, protocol failures discard a
//! single connection, dispatch failures go back to the caller and
//! membership failures are retried by the watch loop.

use crate::discovery::MetadataError;
use thiserror::Error;
use trellis_codec::ProtocolError;

/// Main cluster error type
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Dial or socket setup errors against a specific peer
    #[error("Connection error: {message} (target: {target})")]
    Connection {
        message: String,
        target: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed or truncated frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Application traffic addressed to the heartbeat route
    #[error("Route module={module} cmd={cmd} is reserved for heartbeats")]
    ReservedRoute { module: u32, cmd: u32 },

    /// Checkout from a pool that has been closed
    #[error("Connection pool closed (target: {target})")]
    PoolClosed { target: String },

    /// Send on a node without a live pool
    #[error("Node {service_id} is not connected")]
    NotConnected { service_id: String },

    /// Operation timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Dispatch to a route with no handler
    #[error("No handler registered for module={module} cmd={cmd}")]
    HandlerNotRegistered { module: u32, cmd: u32 },

    /// Handler returned an error
    #[error("Handler for module={module} cmd={cmd} failed: {message}")]
    Handler {
        module: u32,
        cmd: u32,
        message: String,
    },

    /// Membership source query failed
    #[error("Membership error: {message}")]
    Membership { message: String },

    /// Instance metadata failed validation
    #[error("Invalid metadata: {0}")]
    Metadata(#[from] MetadataError),

    /// Add of an identity already in the node map
    #[error("Node already exists: {service_id}")]
    NodeExists { service_id: String },

    /// Update of an identity missing from the node map
    #[error("Node not found: {service_id}")]
    NodeNotFound { service_id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        target: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            target: target.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn reserved_route(module: u32, cmd: u32) -> Self {
        Self::ReservedRoute { module, cmd }
    }

    pub fn pool_closed(target: impl Into<String>) -> Self {
        Self::PoolClosed {
            target: target.into(),
        }
    }

    pub fn not_connected(service_id: impl Into<String>) -> Self {
        Self::NotConnected {
            service_id: service_id.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn handler_not_registered(module: u32, cmd: u32) -> Self {
        Self::HandlerNotRegistered { module, cmd }
    }

    /// Wrap a handler failure, keeping the full context chain as text
    pub fn handler(module: u32, cmd: u32, err: &anyhow::Error) -> Self {
        Self::Handler {
            module,
            cmd,
            message: format!("{:#}", err),
        }
    }

    /// Create a membership error
    pub fn membership(message: impl Into<String>) -> Self {
        Self::Membership {
            message: message.into(),
        }
    }

    pub fn node_exists(service_id: impl Into<String>) -> Self {
        Self::NodeExists {
            service_id: service_id.into(),
        }
    }

    pub fn node_not_found(service_id: impl Into<String>) -> Self {
        Self::NodeNotFound {
            service_id: service_id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Dial, write or read failure: the owning node should reconnect
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClusterError::Network { .. }
                | ClusterError::Connection { .. }
                | ClusterError::PoolClosed { .. }
                | ClusterError::NotConnected { .. }
                | ClusterError::Timeout { .. }
                | ClusterError::Io { .. }
        )
    }

    /// Bad frame or misuse of the reserved route
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ClusterError::Protocol(_) | ClusterError::ReservedRoute { .. }
        )
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string(), err)
    }
}
