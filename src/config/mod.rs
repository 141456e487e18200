// src/config/mod.rs
mod models;
mod source;

pub use models::*;
pub use source::{api_base_url, source_from_settings, ConfigSource, FileSource, RestSource};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse route descriptors: {0}")]
    Parse(String),

    #[error("invalid settings: {0}")]
    Settings(#[from] ::config::ConfigError),

    #[error("configuration endpoint {endpoint} answered {status}")]
    Status { endpoint: String, status: u16 },

    #[error("configuration transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("invalid descriptor for {path}: {reason}")]
    InvalidDescriptor { path: String, reason: String },

    #[error("load balancer {name} already holds {max} backends")]
    TooManyBackends { name: String, max: usize },

    #[error("invalid header line {0:?}")]
    InvalidHeader(String),

    #[error("invalid control message: {0}")]
    InvalidMessage(String),

    #[error("invalid listen address {0}")]
    ListenAddress(String),

    #[error("no configuration source: set routes_file or api.backend")]
    NoSource,

    #[error("configuration produced no routes")]
    Empty,
}

/// Load process settings from an optional file, overridden by `CHAINLB__*`
/// environment variables (`CHAINLB__LISTEN__PORT=9100`).
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = ::config::Config::builder();

    if let Some(path) = path {
        info!("Loading settings from: {}", path.display());
        builder = builder.add_source(::config::File::from(path).required(false));
    }

    let settings = builder
        .add_source(
            ::config::Environment::with_prefix("CHAINLB")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("static_headers")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<Settings>()?;

    Ok(settings)
}

/// Parse a JSON array of route descriptors. Entries that fail to decode are
/// skipped with a warning; a document that is not an array is an error.
pub fn parse_json_descriptors(contents: &str) -> Result<Vec<RouteDescriptor>, ConfigError> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!(index, "Skipping route descriptor: {}", e);
                None
            }
        })
        .collect())
}

/// YAML counterpart of [`parse_json_descriptors`].
pub fn parse_yaml_descriptors(contents: &str) -> Result<Vec<RouteDescriptor>, ConfigError> {
    let entries: Vec<serde_yaml::Value> =
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_yaml::from_value(entry) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!(index, "Skipping route descriptor: {}", e);
                None
            }
        })
        .collect())
}
