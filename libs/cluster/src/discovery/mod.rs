//! Membership Discovery
//!
//! The contract between the cluster manager and whatever registry tracks
//! healthy members: a long-poll query over a named group, returning every
//! healthy instance plus an opaque index that advances on each change.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub mod memory;
pub mod metadata;

pub use memory::InMemoryRegistry;
pub use metadata::{is_material_change, parse_instance, MetadataError};

/// One healthy member as reported by a membership source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identity (`{type}-{environment}-{id}`)
    pub service_id: String,

    /// Flat metadata bag; see [`trellis_config::meta_keys`]
    pub meta: HashMap<String, String>,
}

/// Result of one membership query
#[derive(Debug, Clone, Default)]
pub struct HealthyInstances {
    pub instances: Vec<ServiceInstance>,

    /// Opaque change index; only ever compared for ordering
    pub index: u64,
}

/// Long-poll query over the healthy members of a group
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Return the healthy instances of `group`
    ///
    /// Returns immediately when the source's index is greater than
    /// `last_index`; otherwise blocks for up to `wait` for a change and then
    /// returns the current state either way.
    async fn healthy_instances(
        &self,
        group: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<HealthyInstances>;
}

impl ServiceInstance {
    pub fn new(service_id: impl Into<String>, meta: HashMap<String, String>) -> Self {
        Self {
            service_id: service_id.into(),
            meta,
        }
    }

    /// Parse this instance's metadata into a typed identity
    pub fn to_app_config(&self) -> Result<trellis_config::AppConfig> {
        Ok(parse_instance(self)?)
    }

    /// Instance describing `app`, as published at registration
    pub fn from_app(app: &trellis_config::AppConfig) -> Self {
        Self {
            service_id: app.service_id(),
            meta: app.to_metadata(),
        }
    }
}
