//! Cluster Manager
//!
//! Owns the authoritative map of peer nodes and keeps it in step with a
//! [`MembershipSource`]. The watch loop long-polls the source; the first
//! response bulk-loads existing members, every later response with an
//! advanced index is diffed against the map and applied.
//!
//! Diffs are sets: the order in which additions, updates and removals are
//! applied within one pass carries no meaning.

use super::events::ClusterEvent;
use super::node::Node;
use super::signal::StopSignal;
use crate::discovery::{is_material_change, HealthyInstances, MembershipSource, ServiceInstance};
use crate::routing::MessageRouter;
use crate::{ClusterError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_config::{AppConfig, ClusterSettings};

/// Progress of the membership watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// No watch started
    Idle,
    /// Waiting for the first response to load existing members
    Initializing,
    /// Applying diffs for every advanced index
    Watching,
    Stopped,
}

/// Difference between the node map and one observed healthy set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipDiff {
    pub added: Vec<(String, AppConfig)>,
    pub updated: Vec<(String, AppConfig)>,
    pub removed: Vec<String>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Summary of the manager's view
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub state: WatchState,
    pub last_index: u64,
}

/// Peer map reconciled against a membership source
pub struct ClusterManager {
    local: AppConfig,
    local_service_id: String,
    settings: ClusterSettings,
    source: Arc<dyn MembershipSource>,
    /// Shared by every node when set; otherwise each node gets its own
    router: Option<Arc<MessageRouter>>,

    nodes: RwLock<HashMap<String, Arc<Node>>>,
    /// Never decreases
    last_index: AtomicU64,
    state: RwLock<WatchState>,

    events: broadcast::Sender<ClusterEvent>,
    stop: StopSignal,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Create a manager for the local member `local`
    ///
    /// Fails when the local identity or the settings are unusable.
    pub fn new(
        local: AppConfig,
        settings: ClusterSettings,
        source: Arc<dyn MembershipSource>,
    ) -> Result<Arc<Self>> {
        Self::build(local, settings, source, None)
    }

    /// Create a manager whose nodes all dispatch through `router`
    pub fn with_router(
        local: AppConfig,
        settings: ClusterSettings,
        source: Arc<dyn MembershipSource>,
        router: Arc<MessageRouter>,
    ) -> Result<Arc<Self>> {
        Self::build(local, settings, source, Some(router))
    }

    fn build(
        local: AppConfig,
        settings: ClusterSettings,
        source: Arc<dyn MembershipSource>,
        router: Option<Arc<MessageRouter>>,
    ) -> Result<Arc<Self>> {
        if local.app_type.trim().is_empty() {
            return Err(ClusterError::configuration(
                "local service type must not be empty",
                Some("type"),
            ));
        }
        if local.environment.trim().is_empty() {
            return Err(ClusterError::configuration(
                "local service environment must not be empty",
                Some("environment"),
            ));
        }
        settings
            .validate()
            .map_err(|e| ClusterError::configuration(format!("{:#}", e), None))?;

        let (events, _) = broadcast::channel(settings.event_capacity);

        Ok(Arc::new(Self {
            local_service_id: local.service_id(),
            local,
            settings,
            source,
            router,
            nodes: RwLock::new(HashMap::new()),
            last_index: AtomicU64::new(0),
            state: RwLock::new(WatchState::Idle),
            events,
            stop: StopSignal::new(),
            watch_task: Mutex::new(None),
        }))
    }

    // --- accessors ---

    pub fn local(&self) -> &AppConfig {
        &self.local
    }

    pub fn local_service_id(&self) -> &str {
        &self.local_service_id
    }

    pub fn state(&self) -> WatchState {
        *self.state.read()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn get_all_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn get_node(&self, service_id: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(service_id).cloned()
    }

    pub fn get_nodes_by_type(&self, node_type: &str) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .values()
            .filter(|node| node.node_type() == node_type)
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn stats(&self) -> ClusterStats {
        let mut nodes_by_type = BTreeMap::new();
        let nodes = self.get_all_nodes();
        for node in &nodes {
            *nodes_by_type.entry(node.node_type()).or_insert(0) += 1;
        }
        ClusterStats {
            total_nodes: nodes.len(),
            nodes_by_type,
            state: self.state(),
            last_index: self.last_index(),
        }
    }

    // --- manual topology edits ---

    /// Insert a node for `service_id` and start connecting it in the background
    pub fn add_node(&self, service_id: &str, config: AppConfig) -> Result<Arc<Node>> {
        if service_id == self.local_service_id {
            return Err(ClusterError::configuration(
                format!("refusing to add local node {}", service_id),
                Some("service_id"),
            ));
        }
        if self.stop.is_stopped() {
            return Err(ClusterError::configuration("cluster manager is closed", None));
        }

        let node = {
            let mut nodes = self.nodes.write();
            // close() clears the map under this lock after raising stop
            if self.stop.is_stopped() {
                return Err(ClusterError::configuration("cluster manager is closed", None));
            }
            if nodes.contains_key(service_id) {
                return Err(ClusterError::node_exists(service_id));
            }
            let node = match &self.router {
                Some(router) => Node::with_router(
                    service_id,
                    config.clone(),
                    self.settings.clone(),
                    router.clone(),
                )?,
                None => Node::new(service_id, config.clone(), self.settings.clone())?,
            };
            nodes.insert(service_id.to_string(), node.clone());
            node
        };

        info!(service_id = %service_id, peer = %config.socket_addr(), "Node added");
        self.publish(ClusterEvent::NodeAdded {
            service_id: service_id.to_string(),
            config,
        });

        let connecting = node.clone();
        tokio::spawn(async move {
            if let Err(e) = connecting.connect().await {
                warn!(service_id = %connecting.service_id(), error = %e, "Initial connect failed");
            }
        });

        Ok(node)
    }

    /// Replace the config of a known node in place
    pub fn update_node(&self, service_id: &str, config: AppConfig) -> Result<()> {
        let node = self
            .get_node(service_id)
            .ok_or_else(|| ClusterError::node_not_found(service_id))?;

        let previous = node.config();
        node.update_config(config.clone());

        self.publish(ClusterEvent::NodeUpdated {
            service_id: service_id.to_string(),
            previous,
            current: config,
        });
        Ok(())
    }

    /// Disconnect and forget a node; returns whether it was present
    pub async fn remove_node(&self, service_id: &str) -> bool {
        let removed = self.nodes.write().remove(service_id);
        let Some(node) = removed else {
            return false;
        };

        node.disconnect().await;
        info!(service_id = %service_id, "Node removed");
        self.publish(ClusterEvent::NodeRemoved {
            service_id: service_id.to_string(),
        });
        true
    }

    // --- reconciliation ---

    /// Compare `instances` with the node map without changing anything
    ///
    /// The local identity is excluded. An instance whose metadata does not
    /// parse is skipped when unknown and left untouched when known.
    pub fn diff(&self, instances: &[ServiceInstance]) -> MembershipDiff {
        let known: HashMap<String, AppConfig> = self
            .nodes
            .read()
            .iter()
            .map(|(id, node)| (id.clone(), node.config()))
            .collect();

        let mut diff = MembershipDiff::default();
        let mut seen = HashSet::new();

        for instance in instances {
            let service_id = instance.service_id.as_str();
            if service_id == self.local_service_id || !seen.insert(service_id) {
                continue;
            }

            let config = match instance.to_app_config() {
                Ok(config) => config,
                Err(e) => {
                    warn!(service_id = %service_id, error = %e, "Skipping instance with invalid metadata");
                    continue;
                }
            };

            match known.get(service_id) {
                None => diff.added.push((service_id.to_string(), config)),
                Some(previous) if is_material_change(previous, &config) => {
                    diff.updated.push((service_id.to_string(), config))
                }
                Some(_) => {}
            }
        }

        diff.removed = known
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();

        diff
    }

    /// Apply a diff to the node map and publish the resulting events
    pub async fn apply(&self, diff: MembershipDiff) {
        if diff.is_empty() {
            return;
        }

        let mut added = Vec::with_capacity(diff.added.len());
        for (service_id, config) in diff.added {
            match self.add_node(&service_id, config) {
                Ok(_) => added.push(service_id),
                Err(e) => warn!(service_id = %service_id, error = %e, "Failed to add node"),
            }
        }

        let mut updated = Vec::with_capacity(diff.updated.len());
        for (service_id, config) in diff.updated {
            match self.update_node(&service_id, config) {
                Ok(()) => updated.push(service_id),
                Err(e) => warn!(service_id = %service_id, error = %e, "Failed to update node"),
            }
        }

        let mut removed = Vec::with_capacity(diff.removed.len());
        for service_id in diff.removed {
            if self.remove_node(&service_id).await {
                removed.push(service_id);
            }
        }

        let total = self.node_count();
        info!(
            total,
            added = added.len(),
            updated = updated.len(),
            removed = removed.len(),
            "Cluster membership changed"
        );
        for node in self.get_all_nodes() {
            if let Ok(json) = serde_json::to_string(&node.snapshot()) {
                debug!(node = %json, "Cluster node");
            }
        }

        self.publish(ClusterEvent::ClusterChanged {
            total,
            added,
            updated,
            removed,
        });
    }

    // --- watch ---

    /// Start watching `group` on the membership source
    ///
    /// Only one watch may run per manager.
    pub fn watch_services(self: &Arc<Self>, group: &str) -> Result<()> {
        if group.trim().is_empty() {
            return Err(ClusterError::configuration(
                "membership group must not be empty",
                Some("group"),
            ));
        }

        {
            let mut state = self.state.write();
            if *state != WatchState::Idle {
                return Err(ClusterError::configuration(
                    format!("membership watch already {:?}", *state).to_lowercase(),
                    Some("group"),
                ));
            }
            *state = WatchState::Initializing;
        }

        info!(group = %group, "Watching membership");
        let task = tokio::spawn(Self::watch_loop(self.clone(), group.to_string()));
        *self.watch_task.lock() = Some(task);
        Ok(())
    }

    /// Stop the watch, disconnect every node and publish `ClusterClosed`
    pub async fn close(&self) {
        if !self.stop.stop() {
            return;
        }
        self.set_state(WatchState::Stopped);

        let watch = self.watch_task.lock().take();
        if let Some(task) = watch {
            let _ = task.await;
        }

        let nodes: Vec<Arc<Node>> = self.nodes.write().drain().map(|(_, node)| node).collect();
        futures::future::join_all(nodes.iter().map(|node| node.disconnect())).await;

        self.publish(ClusterEvent::ClusterClosed);
        info!(disconnected = nodes.len(), "Cluster manager closed");
    }

    async fn watch_loop(manager: Arc<Self>, group: String) {
        let wait = manager.settings.watch_wait();
        let retry_delay = manager.settings.watch_retry_delay();

        loop {
            let last_index = manager.last_index();
            let result = tokio::select! {
                _ = manager.stop.wait() => break,
                result = manager.source.healthy_instances(&group, last_index, wait) => result,
            };

            match result {
                Ok(response) => manager.handle_response(&group, response).await,
                Err(e) => {
                    warn!(
                        group = %group,
                        error = %e,
                        retry_in_ms = manager.settings.watch_retry_delay_ms,
                        "Membership query failed"
                    );
                    tokio::select! {
                        _ = manager.stop.wait() => break,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
        debug!(group = %group, "Membership watch exited");
    }

    async fn handle_response(&self, group: &str, response: HealthyInstances) {
        if self.stop.is_stopped() {
            return;
        }
        if self.state() == WatchState::Initializing {
            self.initial_load(&response.instances);
            self.last_index.fetch_max(response.index, Ordering::AcqRel);
            {
                let mut state = self.state.write();
                if *state != WatchState::Initializing {
                    return;
                }
                *state = WatchState::Watching;
            }
            info!(group = %group, index = response.index, nodes = self.node_count(), "Membership watch ready");
            return;
        }

        let last_index = self.last_index();
        if response.index < last_index {
            warn!(
                group = %group,
                index = response.index,
                last_index,
                "Membership index went backwards; ignoring response"
            );
            return;
        }
        if response.index == last_index {
            return;
        }

        debug!(group = %group, index = response.index, "Membership change detected");
        let diff = self.diff(&response.instances);
        self.last_index.fetch_max(response.index, Ordering::AcqRel);
        self.apply(diff).await;
    }

    fn initial_load(&self, instances: &[ServiceInstance]) {
        info!(instances = instances.len(), "Loading existing members");
        for instance in instances {
            if self.stop.is_stopped() {
                break;
            }
            if instance.service_id == self.local_service_id {
                continue;
            }
            match instance.to_app_config() {
                Ok(config) => {
                    if let Err(e) = self.add_node(&instance.service_id, config) {
                        warn!(service_id = %instance.service_id, error = %e, "Failed to load member");
                    }
                }
                Err(e) => {
                    warn!(service_id = %instance.service_id, error = %e, "Skipping instance with invalid metadata");
                }
            }
        }
    }

    fn set_state(&self, state: WatchState) {
        *self.state.write() = state;
    }

    fn publish(&self, event: ClusterEvent) {
        debug!(event = event.name(), service_id = ?event.service_id(), "Publishing cluster event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("local", &self.local_service_id)
            .field("state", &self.state())
            .field("nodes", &self.node_count())
            .finish()
    }
}
