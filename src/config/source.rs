// src/config/source.rs
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{parse_json_descriptors, parse_yaml_descriptors, ApiSettings, ConfigError, RouteDescriptor, Settings};

/// Where route descriptors come from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<Vec<RouteDescriptor>, ConfigError>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// Descriptors read from a local YAML or JSON file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    async fn load(&self) -> Result<Vec<RouteDescriptor>, ConfigError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;

        match self.path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => parse_yaml_descriptors(&contents),
            _ => parse_json_descriptors(&contents),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Descriptors fetched from `GET {backend}/loadbalancer`.
pub struct RestSource {
    client: Client,
    endpoint: String,
    access_key: String,
    secret: String,
}

impl RestSource {
    pub fn new(api: &ApiSettings) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/loadbalancer", api_base_url(&api.backend)),
            access_key: api.access_key.clone(),
            secret: api.secret.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ConfigSource for RestSource {
    async fn load(&self) -> Result<Vec<RouteDescriptor>, ConfigError> {
        debug!("Fetching route descriptors from {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .header("AccessKey", &self.access_key)
            .header("Secret", &self.secret)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ConfigError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        parse_json_descriptors(&body)
    }

    fn describe(&self) -> String {
        format!("api {}", self.endpoint)
    }
}

/// `10.0.0.1:8080` and `http://10.0.0.1:8080/` both become
/// `http://10.0.0.1:8080`.
pub fn api_base_url(backend: &str) -> String {
    let trimmed = backend.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// A local routes file wins over the API backend.
pub fn source_from_settings(settings: &Settings) -> Result<Arc<dyn ConfigSource>, ConfigError> {
    if let Some(path) = &settings.routes_file {
        return Ok(Arc::new(FileSource::new(path)));
    }
    if !settings.api.backend.trim().is_empty() {
        return Ok(Arc::new(RestSource::new(&settings.api)?));
    }
    Err(ConfigError::NoSource)
}
