//! Instance metadata parsing
//!
//! Turns the flat string bag a membership source carries back into an
//! [`AppConfig`]. Every required key must be present and well-formed; there
//! is no silent defaulting.

use super::ServiceInstance;
use std::collections::BTreeMap;
use thiserror::Error;
use trellis_config::{meta_keys, Addr, AppConfig};

/// Why an instance's metadata could not be parsed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key '{key}' is missing")]
    Missing { key: &'static str },

    #[error("metadata key '{key}' has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl MetadataError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse an instance's metadata into a typed identity
pub fn parse_instance(instance: &ServiceInstance) -> Result<AppConfig, MetadataError> {
    let host = required(instance, meta_keys::HOST)?;
    let port_raw = required(instance, meta_keys::PORT)?;
    let app_type = required(instance, meta_keys::TYPE)?;
    let environment = required(instance, meta_keys::ENVIRONMENT)?;
    let id_raw = required(instance, meta_keys::ID)?;

    let port = port_raw
        .trim()
        .parse::<u16>()
        .map_err(|e| MetadataError::invalid(meta_keys::PORT, port_raw, e.to_string()))?;
    let id = id_raw
        .trim()
        .parse::<u16>()
        .map_err(|e| MetadataError::invalid(meta_keys::ID, id_raw, e.to_string()))?;

    let data = match instance.meta.get(meta_keys::DATA) {
        Some(raw) if !raw.trim().is_empty() => parse_data(raw)?,
        _ => BTreeMap::new(),
    };

    Ok(AppConfig {
        id,
        app_type: app_type.to_string(),
        environment: environment.to_string(),
        addr: Addr::new(host, port),
        data,
    })
}

/// True when `current` differs from `previous` in identity, address or data
///
/// `data` is compared structurally, so key order inside the embedded JSON
/// does not register as a change.
pub fn is_material_change(previous: &AppConfig, current: &AppConfig) -> bool {
    previous.id != current.id
        || previous.app_type != current.app_type
        || previous.environment != current.environment
        || previous.addr != current.addr
        || previous.data != current.data
}

fn required<'a>(
    instance: &'a ServiceInstance,
    key: &'static str,
) -> Result<&'a str, MetadataError> {
    match instance.meta.get(key) {
        None => Err(MetadataError::Missing { key }),
        Some(value) if value.trim().is_empty() => {
            Err(MetadataError::invalid(key, value, "value is empty"))
        }
        Some(value) => Ok(value.as_str()),
    }
}

fn parse_data(raw: &str) -> Result<BTreeMap<String, serde_json::Value>, MetadataError> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err(MetadataError::invalid(
            meta_keys::DATA,
            raw,
            "expected a JSON object",
        )),
        Err(e) => Err(MetadataError::invalid(meta_keys::DATA, raw, e.to_string())),
    }
}
