//! Peer Node
//!
//! One remote cluster member: its identity, a pool of outbound connections
//! and the router that receives its replies. Once connected, a node runs
//! three kinds of background task:
//!
//! - **monitor**: reacts to reconnect signals and checks pool liveness
//! - **heartbeat**: sends a heartbeat on every pooled connection each tick
//! - **receive**: one per connection, decoding and dispatching inbound frames
//!
//! Reconnect signals carry the generation of the pool they were raised
//! against. Every install or removal of a pool advances the generation, so a
//! burst of failures from one pool produces exactly one reconnect.

use super::signal::StopSignal;
use crate::routing::MessageRouter;
use crate::transports::{tcp, ConnectionPool};
use crate::{ClusterError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trellis_codec::{Frame, RequestFrame};
use trellis_config::{AppConfig, ClusterSettings};

/// Connection state of a peer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Last dial attempt failed; a retry is scheduled
    Failed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Connected => "connected",
            NodeStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Serializable point-in-time view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub service_id: String,
    pub id: u16,
    #[serde(rename = "type")]
    pub node_type: String,
    pub environment: String,
    pub status: NodeStatus,
    /// RFC 3339
    pub last_update: String,
    pub config: AppConfig,
}

/// A remote cluster member and the connections to it
pub struct Node {
    service_id: String,
    config: RwLock<AppConfig>,
    settings: ClusterSettings,
    router: Arc<MessageRouter>,

    status: RwLock<NodeStatus>,
    last_update: RwLock<DateTime<Utc>>,

    pool: RwLock<Option<Arc<ConnectionPool>>>,
    /// Advanced under the `pool` write lock on every install or removal
    generation: AtomicU64,

    /// Serializes connect, reconnect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    reconnect_tx: mpsc::Sender<u64>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<u64>>>,
    stop: StopSignal,

    loops: Mutex<Vec<JoinHandle<()>>>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node with its own router
    ///
    /// Fails when `settings` has a zero interval or size.
    pub fn new(
        service_id: impl Into<String>,
        config: AppConfig,
        settings: ClusterSettings,
    ) -> Result<Arc<Self>> {
        Self::with_router(service_id, config, settings, Arc::new(MessageRouter::new()))
    }

    /// Create a node that dispatches inbound frames through `router`
    pub fn with_router(
        service_id: impl Into<String>,
        config: AppConfig,
        settings: ClusterSettings,
        router: Arc<MessageRouter>,
    ) -> Result<Arc<Self>> {
        settings
            .validate()
            .map_err(|e| ClusterError::configuration(format!("{:#}", e), None))?;

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Ok(Arc::new(Self {
            service_id: service_id.into(),
            config: RwLock::new(config),
            settings,
            router,
            status: RwLock::new(NodeStatus::Disconnected),
            last_update: RwLock::new(Utc::now()),
            pool: RwLock::new(None),
            generation: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            stop: StopSignal::new(),
            loops: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
        }))
    }

    // --- identity and state ---

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn id(&self) -> u16 {
        self.config.read().id
    }

    pub fn node_type(&self) -> String {
        self.config.read().app_type.clone()
    }

    pub fn environment(&self) -> String {
        self.config.read().environment.clone()
    }

    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        *self.last_update.read()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Current pool, if connected
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.read().clone()
    }

    /// Free connections in the current pool
    pub fn pool_free_count(&self) -> Option<usize> {
        self.pool.read().as_ref().map(|pool| pool.free_count())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let config = self.config();
        NodeSnapshot {
            service_id: self.service_id.clone(),
            id: config.id,
            node_type: config.app_type.clone(),
            environment: config.environment.clone(),
            status: self.status(),
            last_update: self.last_update().to_rfc3339(),
            config,
        }
    }

    /// Replace the config snapshot
    ///
    /// The existing pool keeps running; a new address is dialed on the next
    /// reconnect.
    pub fn update_config(&self, config: AppConfig) {
        *self.config.write() = config;
        *self.last_update.write() = Utc::now();
        info!(service_id = %self.service_id, "Node config updated");
    }

    // --- handlers ---

    pub fn register_handler<F>(&self, module: u32, cmd: u32, handler: F)
    where
        F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.router.register(module, cmd, handler);
    }

    pub fn unregister_handler(&self, module: u32, cmd: u32) -> bool {
        self.router.unregister(module, cmd)
    }

    // --- lifecycle ---

    /// Dial the pool and start the background loops
    ///
    /// A no-op when a pool already exists. On dial failure the node is
    /// marked [`NodeStatus::Failed`], a retry is scheduled after the
    /// reconnect delay and the error is returned.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.stop.is_stopped() {
            return Err(ClusterError::not_connected(&self.service_id));
        }
        if self.pool.read().is_some() {
            return Ok(());
        }

        self.start_loops();
        self.set_status(NodeStatus::Connecting);

        let target = self.target();
        info!(service_id = %self.service_id, peer = %target, "Connecting to node");

        match self.open_pool(&target).await {
            Ok(pool) => {
                let pool = self.install_pool(pool);
                self.set_status(NodeStatus::Connected);
                info!(
                    service_id = %self.service_id,
                    connections = pool.size(),
                    "Connected to node"
                );
                self.send_initial_heartbeat(&pool).await;
                Ok(())
            }
            Err(e) => {
                self.set_status(NodeStatus::Failed);
                warn!(service_id = %self.service_id, error = %e, "Failed to connect to node");
                self.schedule_retry();
                Err(e)
            }
        }
    }

    /// Stop all loops and close the pool; safe to call more than once
    pub async fn disconnect(&self) {
        let first = self.stop.stop();
        let _guard = self.lifecycle.lock().await;

        if let Some(pool) = self.remove_pool() {
            pool.close();
        }
        self.abort_receivers();
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
        self.set_status(NodeStatus::Disconnected);

        if first {
            info!(service_id = %self.service_id, "Disconnected from node");
        }
    }

    // --- sending ---

    /// Write `request` on a pooled connection without waiting for a reply
    ///
    /// A write failure raises the reconnect signal before the error is
    /// returned.
    pub async fn send_req(&self, request: RequestFrame) -> Result<()> {
        if request.is_heartbeat() {
            return Err(ClusterError::reserved_route(request.module, request.cmd));
        }

        let (pool, generation) = self
            .current_pool()
            .ok_or_else(|| ClusterError::not_connected(&self.service_id))?;

        let mut conn = pool.get().await?;
        let result = conn.send(&Frame::Request(request)).await;
        pool.put(conn);

        if let Err(e) = &result {
            warn!(service_id = %self.service_id, error = %e, "Send failed");
            self.signal_reconnect(generation);
        }
        result
    }

    /// Send a request under a fresh session id and return that id
    pub async fn send(&self, module: u32, cmd: u32, payload: impl Into<bytes::Bytes>) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.send_req(RequestFrame::new(module, cmd, session_id.clone(), payload))
            .await?;
        Ok(session_id)
    }

    /// Send one heartbeat on every pooled connection
    ///
    /// Returns the number of successful sends. When every send fails the
    /// reconnect signal is raised for the current pool.
    pub async fn heartbeat_tick(&self) -> usize {
        if self.status() != NodeStatus::Connected {
            return 0;
        }
        let Some((pool, generation)) = self.current_pool() else {
            return 0;
        };

        let checkout_limit = self.settings.heartbeat_interval();
        let mut conns = Vec::with_capacity(pool.size());
        let mut last_error = None;

        for _ in 0..pool.size() {
            match tokio::time::timeout(checkout_limit, pool.get()).await {
                Ok(Ok(conn)) => conns.push(conn),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(ClusterError::timeout(
                        "heartbeat checkout",
                        checkout_limit.as_millis() as u64,
                    ))
                }
            }
        }

        let heartbeat = Frame::Request(RequestFrame::heartbeat());
        let mut sent = 0;
        for mut conn in conns {
            match conn.send(&heartbeat).await {
                Ok(()) => sent += 1,
                Err(e) => last_error = Some(e),
            }
            pool.put(conn);
        }

        if sent == 0 {
            warn!(
                service_id = %self.service_id,
                error = ?last_error.map(|e| e.to_string()),
                "Heartbeat failed on every connection"
            );
            self.signal_reconnect(generation);
        } else if let Some(e) = last_error {
            debug!(
                service_id = %self.service_id,
                sent,
                error = %e,
                "Heartbeat partially failed"
            );
        }
        sent
    }

    // --- internals ---

    fn target(&self) -> String {
        self.config.read().socket_addr()
    }

    fn set_status(&self, status: NodeStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            debug!(service_id = %self.service_id, from = %previous, to = %status, "Node status changed");
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn current_pool(&self) -> Option<(Arc<ConnectionPool>, u64)> {
        let slot = self.pool.read();
        slot.as_ref()
            .map(|pool| (pool.clone(), self.generation.load(Ordering::Acquire)))
    }

    fn remove_pool(&self) -> Option<Arc<ConnectionPool>> {
        let mut slot = self.pool.write();
        let pool = slot.take();
        if pool.is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        pool
    }

    async fn open_pool(&self, target: &str) -> Result<ConnectionPool> {
        tokio::select! {
            _ = self.stop.wait() => Err(ClusterError::not_connected(&self.service_id)),
            pool = ConnectionPool::connect(
                target,
                self.settings.pool_size,
                self.settings.dial_timeout(),
            ) => pool,
        }
    }

    /// Publish `pool` as current and start one receive loop per connection
    fn install_pool(self: &Arc<Self>, pool: ConnectionPool) -> Arc<ConnectionPool> {
        let pool = Arc::new(pool);
        let readers = pool.take_readers();

        let generation = {
            let mut slot = self.pool.write();
            *slot = Some(pool.clone());
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        self.abort_receivers();
        let handles: Vec<_> = readers
            .into_iter()
            .map(|(slot, reader)| {
                tokio::spawn(Self::receive_loop(self.clone(), reader, slot, generation))
            })
            .collect();
        *self.receivers.lock() = handles;

        pool
    }

    fn abort_receivers(&self) {
        for handle in self.receivers.lock().drain(..) {
            handle.abort();
        }
    }

    fn start_loops(self: &Arc<Self>) {
        let Some(rx) = self.reconnect_rx.lock().take() else {
            return;
        };
        let monitor = tokio::spawn(Self::monitor_loop(self.clone(), rx));
        let heartbeat = tokio::spawn(Self::heartbeat_loop(self.clone()));
        self.loops.lock().extend([monitor, heartbeat]);
    }

    fn signal_reconnect(&self, generation: u64) {
        match self.reconnect_tx.try_send(generation) {
            Ok(()) => debug!(service_id = %self.service_id, generation, "Reconnect signalled"),
            Err(TrySendError::Full(_)) => {
                debug!(service_id = %self.service_id, "Reconnect already pending")
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Retry the connection after the reconnect delay
    fn schedule_retry(self: &Arc<Self>) {
        let node = self.clone();
        let generation = self.generation();
        let delay = self.settings.reconnect_delay();

        tokio::spawn(async move {
            tokio::select! {
                _ = node.stop.wait() => {}
                _ = tokio::time::sleep(delay) => {
                    // Retries must not be dropped when a signal is already pending
                    let _ = node.reconnect_tx.send(generation).await;
                }
            }
        });
    }

    async fn reconnect(self: &Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        if self.stop.is_stopped() {
            return;
        }

        if let Some(old) = self.remove_pool() {
            old.close();
        }
        self.abort_receivers();
        self.set_status(NodeStatus::Connecting);

        let target = self.target();
        info!(service_id = %self.service_id, peer = %target, "Reconnecting to node");

        match self.open_pool(&target).await {
            Ok(pool) => {
                let pool = self.install_pool(pool);
                self.set_status(NodeStatus::Connected);
                info!(service_id = %self.service_id, "Reconnected to node");
                self.send_initial_heartbeat(&pool).await;
            }
            Err(e) => {
                if self.stop.is_stopped() {
                    return;
                }
                self.set_status(NodeStatus::Failed);
                error!(
                    service_id = %self.service_id,
                    error = %e,
                    retry_in_ms = self.settings.reconnect_delay_ms,
                    "Reconnect failed"
                );
                self.schedule_retry();
            }
        }
    }

    /// Satisfy the remote listener's initial read deadline right away
    async fn send_initial_heartbeat(&self, pool: &ConnectionPool) {
        let heartbeat = Frame::Request(RequestFrame::heartbeat());
        match pool.get().await {
            Ok(mut conn) => {
                if let Err(e) = conn.send(&heartbeat).await {
                    warn!(service_id = %self.service_id, error = %e, "Initial heartbeat failed");
                }
                pool.put(conn);
            }
            Err(e) => {
                warn!(service_id = %self.service_id, error = %e, "Initial heartbeat skipped");
            }
        }
    }

    /// Treat a pool closed underneath a connected node as a liveness failure
    fn check_connection(&self) {
        if self.status() != NodeStatus::Connected {
            return;
        }
        if let Some((pool, generation)) = self.current_pool() {
            if pool.is_closed() {
                warn!(service_id = %self.service_id, "Pool closed while connected");
                self.signal_reconnect(generation);
            }
        }
    }

    async fn monitor_loop(node: Arc<Self>, mut reconnects: mpsc::Receiver<u64>) {
        let period = node.settings.monitor_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = node.stop.wait() => break,
                _ = ticker.tick() => node.check_connection(),
                Some(generation) = reconnects.recv() => {
                    if generation == node.generation() {
                        node.reconnect().await;
                    } else {
                        debug!(
                            service_id = %node.service_id,
                            generation,
                            current = node.generation(),
                            "Ignoring stale reconnect signal"
                        );
                    }
                }
            }
        }
        debug!(service_id = %node.service_id, "Monitor loop exited");
    }

    async fn heartbeat_loop(node: Arc<Self>) {
        let period = node.settings.heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = node.stop.wait() => break,
                _ = ticker.tick() => {
                    node.heartbeat_tick().await;
                }
            }
        }
        debug!(service_id = %node.service_id, "Heartbeat loop exited");
    }

    async fn receive_loop(node: Arc<Self>, mut reader: OwnedReadHalf, slot: usize, generation: u64) {
        debug!(service_id = %node.service_id, slot, generation, "Receive loop started");
        let max_frame_size = node.settings.max_frame_size;

        loop {
            let frame = tokio::select! {
                _ = node.stop.wait() => return,
                frame = tcp::recv_frame(&mut reader, max_frame_size, None) => frame,
            };

            match frame {
                Err(e) => {
                    if generation == node.generation() {
                        warn!(service_id = %node.service_id, slot, error = %e, "Receive failed");
                    }
                    node.signal_reconnect(generation);
                    return;
                }
                Ok(Frame::Response(response)) if response.is_heartbeat() => {}
                Ok(Frame::Request(request)) if request.is_heartbeat() => {
                    debug!(service_id = %node.service_id, slot, "Ignoring heartbeat request on outbound connection");
                }
                Ok(Frame::Response(response)) => {
                    if !response.is_ok() {
                        debug!(
                            service_id = %node.service_id,
                            module = response.module,
                            cmd = response.cmd,
                            code = response.code,
                            "Peer reported request failure"
                        );
                    }
                    match node.router.dispatch_response(&response) {
                        Ok(()) => {}
                        Err(ClusterError::HandlerNotRegistered { module, cmd }) => {
                            debug!(service_id = %node.service_id, module, cmd, "No handler for reply");
                        }
                        Err(e) => warn!(
                            service_id = %node.service_id,
                            module = response.module,
                            cmd = response.cmd,
                            error = %e,
                            "Response dispatch failed"
                        ),
                    }
                }
                Ok(Frame::Request(request)) => {
                    if let Err(e) = node.router.dispatch_request(&request) {
                        warn!(
                            service_id = %node.service_id,
                            module = request.module,
                            cmd = request.cmd,
                            error = %e,
                            "Request dispatch failed"
                        );
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("service_id", &self.service_id)
            .field("status", &self.status())
            .finish()
    }
}
