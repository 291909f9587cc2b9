//! Message Routing
//!
//! Maps a `(module, cmd)` pair to the application handler for that route.
//! The router is shared between the writers that register handlers and the
//! receive loops that dispatch decoded frames, so every method takes `&self`.

use crate::{ClusterError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use trellis_codec::{RequestFrame, ResponseFrame};

/// Handler invoked with the raw payload of a dispatched frame
///
/// Handlers run on the receive loop of the connection the frame arrived on
/// and must return quickly; decoding on that connection waits for them.
pub type MessageHandler = Arc<dyn Fn(&[u8]) -> anyhow::Result<()> + Send + Sync>;

/// Single 64-bit routing key: module in the high half, cmd in the low half
pub fn route_key(module: u32, cmd: u32) -> u64 {
    ((module as u64) << 32) | cmd as u64
}

/// Handler table keyed by [`route_key`]
#[derive(Default)]
pub struct MessageRouter {
    handlers: RwLock<HashMap<u64, MessageHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `(module, cmd)`, replacing any previous one
    pub fn register<F>(&self, module: u32, cmd: u32, handler: F)
    where
        F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .write()
            .insert(route_key(module, cmd), Arc::new(handler))
            .is_some();
        debug!(module, cmd, replaced, "Registered handler");
    }

    /// Remove the handler for `(module, cmd)`; returns whether one existed
    pub fn unregister(&self, module: u32, cmd: u32) -> bool {
        self.handlers.write().remove(&route_key(module, cmd)).is_some()
    }

    pub fn is_registered(&self, module: u32, cmd: u32) -> bool {
        self.handlers.read().contains_key(&route_key(module, cmd))
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Invoke the handler for `(module, cmd)` with `payload`
    pub fn dispatch(&self, module: u32, cmd: u32, payload: &[u8]) -> Result<()> {
        // Clone out so the handler runs without the table lock held
        let handler = self
            .handlers
            .read()
            .get(&route_key(module, cmd))
            .cloned()
            .ok_or_else(|| ClusterError::handler_not_registered(module, cmd))?;

        handler(payload).map_err(|e| ClusterError::handler(module, cmd, &e))
    }

    pub fn dispatch_request(&self, frame: &RequestFrame) -> Result<()> {
        self.dispatch(frame.module, frame.cmd, &frame.payload)
    }

    pub fn dispatch_response(&self, frame: &ResponseFrame) -> Result<()> {
        self.dispatch(frame.module, frame.cmd, &frame.payload)
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("routes", &self.len())
            .finish()
    }
}
