//! In-memory membership registry
//!
//! A [`MembershipSource`] backed by a map, with long-poll semantics driven by
//! a watch channel. Serves tests, the demo and single-process deployments.

use super::{HealthyInstances, MembershipSource, ServiceInstance};
use crate::{ClusterError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use trellis_config::AppConfig;

#[derive(Default)]
struct RegistryState {
    groups: HashMap<String, BTreeMap<String, ServiceInstance>>,
    pending_failures: usize,
}

/// Membership registry held entirely in process memory
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
    /// Global modify index; starts at 1 so a first query with index 0 returns at once
    index: watch::Sender<u64>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (index, _) = watch::channel(1);
        Self {
            state: Mutex::new(RegistryState::default()),
            index,
        }
    }

    /// Add or replace an instance in `group`
    pub fn register(&self, group: &str, instance: ServiceInstance) {
        {
            let mut state = self.state.lock();
            state
                .groups
                .entry(group.to_string())
                .or_default()
                .insert(instance.service_id.clone(), instance);
        }
        let index = self.bump();
        debug!(group = %group, index, "Registered instance");
    }

    /// Register `app` under its service name
    pub fn register_app(&self, app: &AppConfig) {
        self.register(&app.service_name(), ServiceInstance::from_app(app));
    }

    /// Remove an instance; returns whether it was present
    pub fn deregister(&self, group: &str, service_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state
                .groups
                .get_mut(group)
                .map(|members| members.remove(service_id).is_some())
                .unwrap_or(false)
        };
        if removed {
            let index = self.bump();
            debug!(group = %group, service_id = %service_id, index, "Deregistered instance");
        }
        removed
    }

    /// Make the next `count` queries fail with a membership error
    pub fn fail_next(&self, count: usize) {
        self.state.lock().pending_failures += count;
    }

    /// Current modify index
    pub fn index(&self) -> u64 {
        *self.index.borrow()
    }

    fn bump(&self) -> u64 {
        let mut next = 0;
        self.index.send_modify(|index| {
            *index += 1;
            next = *index;
        });
        next
    }

    fn snapshot(&self, group: &str) -> HealthyInstances {
        // Read the index before the members so a concurrent change is seen again
        let index = self.index();
        let state = self.state.lock();
        let instances = state
            .groups
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        HealthyInstances { instances, index }
    }

    fn take_failure(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl MembershipSource for InMemoryRegistry {
    async fn healthy_instances(
        &self,
        group: &str,
        last_index: u64,
        wait: Duration,
    ) -> Result<HealthyInstances> {
        if self.take_failure() {
            return Err(ClusterError::membership("injected registry failure"));
        }

        let mut changes = self.index.subscribe();
        let current = *changes.borrow_and_update();
        if current <= last_index {
            // Elapsed wait is not an error; the caller sees an unchanged index
            let _ = tokio::time::timeout(wait, changes.wait_for(|index| *index > last_index)).await;
        }

        Ok(self.snapshot(group))
    }
}
