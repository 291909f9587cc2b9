//! Connection Pool for Peer Transport
//!
//! A fixed set of pre-dialed TCP connections to one peer. Each socket is
//! split: the write half lives in a pool slot and is lent out by [`get`],
//! the read half is handed once to the pool owner for its receive loop.
//!
//! Free slots are tracked by a semaphore (one permit per free slot) plus an
//! index list, so checkout blocks without polling and closing the pool wakes
//! every waiter with [`ClusterError::PoolClosed`].
//!
//! [`get`]: ConnectionPool::get

use crate::transports::tcp;
use crate::{ClusterError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_codec::Frame;

/// Pool size used when a caller asks for zero connections
pub const DEFAULT_POOL_SIZE: usize = 4;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Slot storage guarded by one lock
struct Slots {
    writers: Vec<Option<OwnedWriteHalf>>,
    free: Vec<usize>,
}

/// Fixed-size pool of connections to a single peer
pub struct ConnectionPool {
    id: u64,
    target: String,
    size: usize,
    slots: Mutex<Slots>,
    readers: Mutex<Option<Vec<(usize, OwnedReadHalf)>>>,
    /// One permit per free slot
    available: Semaphore,
    closed: AtomicBool,
}

/// Write half of a pooled connection, on loan from its pool
pub struct PooledConnection {
    pool_id: u64,
    slot: usize,
    writer: OwnedWriteHalf,
}

impl PooledConnection {
    /// Slot index this connection occupies in its pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Write one frame on this connection
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        tcp::send_frame(&mut self.writer, frame).await
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.pool_id)
            .field("slot", &self.slot)
            .finish()
    }
}

impl ConnectionPool {
    /// Dial `size` connections to `target` sequentially under one deadline
    ///
    /// All-or-nothing: if any dial fails or the deadline passes, every
    /// connection opened so far is closed and the error is returned. A `size`
    /// of zero falls back to [`DEFAULT_POOL_SIZE`].
    pub async fn connect(target: &str, size: usize, dial_timeout: Duration) -> Result<Self> {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let deadline = Instant::now() + dial_timeout;

        let mut writers = Vec::with_capacity(size);
        let mut readers = Vec::with_capacity(size);

        for slot in 0..size {
            // Dropping the halves collected so far closes those sockets
            let stream = tokio::time::timeout_at(deadline, tcp::dial(target))
                .await
                .map_err(|_| {
                    ClusterError::timeout(
                        format!("dialing {} ({} of {})", target, slot + 1, size),
                        dial_timeout.as_millis() as u64,
                    )
                })??;

            let (read_half, write_half) = stream.into_split();
            readers.push((slot, read_half));
            writers.push(Some(write_half));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        info!(peer = %target, size, pool_id = id, "Connection pool established");

        Ok(Self {
            id,
            target: target.to_string(),
            size,
            slots: Mutex::new(Slots {
                writers,
                free: (0..size).collect(),
            }),
            readers: Mutex::new(Some(readers)),
            available: Semaphore::new(size),
            closed: AtomicBool::new(false),
        })
    }

    /// Check out a connection, waiting until one is free
    ///
    /// Fails only when the pool is (or becomes) closed.
    pub async fn get(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(ClusterError::pool_closed(&self.target));
        }

        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| ClusterError::pool_closed(&self.target))?;
        // The permit is restored by `put`, not by drop
        permit.forget();

        let mut slots = self.slots.lock();
        if self.is_closed() {
            return Err(ClusterError::pool_closed(&self.target));
        }

        let checked_out = slots
            .free
            .pop()
            .and_then(|slot| slots.writers[slot].take().map(|writer| (slot, writer)));

        match checked_out {
            Some((slot, writer)) => Ok(PooledConnection {
                pool_id: self.id,
                slot,
                writer,
            }),
            None => Err(ClusterError::pool_closed(&self.target)),
        }
    }

    /// Return a connection to the free list
    ///
    /// A connection returned to a closed pool is dropped. Connections from
    /// another pool, or for a slot that is already filled, are ignored.
    pub fn put(&self, conn: PooledConnection) {
        if conn.pool_id != self.id {
            warn!(
                peer = %self.target,
                pool_id = self.id,
                foreign_pool_id = conn.pool_id,
                "Ignoring connection from another pool"
            );
            return;
        }

        let mut slots = self.slots.lock();
        if self.is_closed() {
            debug!(peer = %self.target, slot = conn.slot, "Dropping connection returned to closed pool");
            return;
        }

        let slot = conn.slot;
        if slots.writers[slot].is_some() {
            warn!(peer = %self.target, slot, "Ignoring return of a slot that is already filled");
            return;
        }

        slots.writers[slot] = Some(conn.writer);
        slots.free.push(slot);
        drop(slots);
        self.available.add_permits(1);
    }

    /// Hand over the read halves, tagged with their slot index
    ///
    /// Returns an empty list on every call after the first.
    pub fn take_readers(&self) -> Vec<(usize, OwnedReadHalf)> {
        self.readers.lock().take().unwrap_or_default()
    }

    /// Close every connection; only the first call has an effect
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.available.close();

        let mut slots = self.slots.lock();
        let open = slots.writers.iter().filter(|w| w.is_some()).count();
        slots.writers.iter_mut().for_each(|w| *w = None);
        slots.free.clear();
        drop(slots);

        self.readers.lock().take();

        info!(
            peer = %self.target,
            pool_id = self.id,
            closed_idle = open,
            "Connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of connections the pool was built with
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of connections currently available for checkout
    pub fn free_count(&self) -> usize {
        self.slots.lock().free.len()
    }

    /// Peer address the pool dials
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Process-unique identity of this pool
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}
