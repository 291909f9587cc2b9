//! Service identity
//!
//! An [`AppConfig`] names one cluster member: its numeric id, kind, deployment
//! environment, reachable address and free-form data. The same type describes
//! the local process and every peer parsed out of membership metadata.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Keys of the flat metadata bag exchanged with membership sources
pub mod meta_keys {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const TYPE: &str = "type";
    pub const ENVIRONMENT: &str = "environment";
    pub const ID: &str = "id";
    pub const DATA: &str = "data";
}

/// Network address a member accepts peer connections on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Addr {
    pub host: String,
    pub port: u16,
}

/// Identity and address of a cluster member
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    pub id: u16,

    #[serde(rename = "type")]
    pub app_type: String,

    pub environment: String,
    pub addr: Addr,

    /// Arbitrary extra fields, carried through membership as embedded JSON
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Addr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl AppConfig {
    pub fn new(
        id: u16,
        app_type: impl Into<String>,
        environment: impl Into<String>,
        addr: Addr,
    ) -> Self {
        Self {
            id,
            app_type: app_type.into(),
            environment: environment.into(),
            addr,
            data: BTreeMap::new(),
        }
    }

    /// Builder-style setter for one `data` entry
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Unique instance identity: `{type}-{environment}-{id}`
    pub fn service_id(&self) -> String {
        format!("{}-{}-{}", self.app_type, self.environment, self.id)
    }

    /// Membership group shared by members of the same kind: `{type}-{environment}`
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.app_type, self.environment)
    }

    /// `host:port` suitable for dialing or binding
    pub fn socket_addr(&self) -> String {
        self.addr.to_string()
    }

    /// Flatten into the metadata bag published to a membership source
    ///
    /// `data` is embedded as a JSON object string and omitted when empty.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        meta.insert(meta_keys::HOST.to_string(), self.addr.host.clone());
        meta.insert(meta_keys::PORT.to_string(), self.addr.port.to_string());
        meta.insert(meta_keys::TYPE.to_string(), self.app_type.clone());
        meta.insert(meta_keys::ENVIRONMENT.to_string(), self.environment.clone());
        meta.insert(meta_keys::ID.to_string(), self.id.to_string());

        if !self.data.is_empty() {
            if let Ok(json) = serde_json::to_string(&self.data) {
                meta.insert(meta_keys::DATA.to_string(), json);
            }
        }
        meta
    }
}
