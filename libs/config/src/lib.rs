//! # Trellis Configuration
//!
//! Typed settings shared by every service that embeds the cluster mesh.
//!
//! ## Features
//!
//! - **Identity**: [`AppConfig`] names a member and derives its service id
//!   and membership group
//! - **Cluster tunables**: [`ClusterSettings`] with defaults for pools,
//!   heartbeats, reconnects, the membership watch and the listener
//! - **Loading**: [`Settings::load`] layers TOML files and `TRELLIS_`
//!   environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trellis_config::Settings;
//!
//! let settings = Settings::load(None, Some("prod")).expect("settings");
//! println!("joining {}", settings.app.service_name());
//! ```

pub mod app;
pub mod cluster;
pub mod defaults;
pub mod settings;

// Re-export commonly used types
pub use app::{meta_keys, Addr, AppConfig};
pub use cluster::ClusterSettings;
pub use settings::{Settings, ENV_PREFIX};
