//! Peer Transport
//!
//! Everything that touches sockets: dialing and framed I/O ([`tcp`]), the
//! per-peer [`ConnectionPool`] and the inbound [`Listener`].

pub mod listener;
pub mod pool;
pub mod tcp;

#[cfg(test)]
mod tests;

pub use listener::Listener;
pub use pool::{ConnectionPool, PooledConnection, DEFAULT_POOL_SIZE};
pub use tcp::{dial, recv_frame, send_frame};
