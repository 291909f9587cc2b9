//! Default values for cluster settings
//!
//! Every field of [`crate::ClusterSettings`] falls back to one of these when
//! absent from configuration files and environment.

/// Connection pool defaults
pub mod pool {
    /// Connections dialed per peer
    pub const SIZE: usize = 4;

    /// Overall deadline for dialing a full pool (milliseconds)
    pub const DIAL_TIMEOUT_MS: u64 = 10_000;
}

/// Peer node loop defaults
pub mod node {
    /// Heartbeat send interval (milliseconds)
    pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;

    /// Connection monitor tick (milliseconds)
    pub const MONITOR_INTERVAL_MS: u64 = 5_000;

    /// Pause before retrying a failed reconnect (milliseconds)
    pub const RECONNECT_DELAY_MS: u64 = 5_000;
}

/// Membership watch defaults
pub mod watch {
    /// Maximum long-poll wait per membership query (milliseconds)
    pub const WAIT_MS: u64 = 30_000;

    /// Back-off after a failed membership query (milliseconds)
    pub const RETRY_DELAY_MS: u64 = 5_000;

    /// Buffered cluster events per subscriber
    pub const EVENT_CAPACITY: usize = 256;
}

/// Inbound listener defaults
pub mod listener {
    /// Read deadline before the first frame arrives (milliseconds)
    pub const INITIAL_TIMEOUT_MS: u64 = 10_000;

    /// Read deadline between subsequent frames (milliseconds)
    pub const IDLE_TIMEOUT_MS: u64 = 30_000;

    /// Largest accepted frame length field
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}
