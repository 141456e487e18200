// src/control/events.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{api_base_url, ConfigError, Settings};

/// Event identifiers understood by the event endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    HealthCheckFailed = 1,
    ConfigurationReloaded = 2,
    ReloadFailed = 3,
    BackendRemoved = 4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "EventID")]
    pub event_id: i32,
    #[serde(rename = "EventData")]
    pub event_data: String,
}

impl Event {
    pub fn new(kind: EventKind, data: impl Into<String>) -> Self {
        Self {
            event_id: kind as i32,
            event_data: data.into(),
        }
    }

    pub fn health_check_failed(route: &str, backend: &str, detail: &str) -> Self {
        Self::new(
            EventKind::HealthCheckFailed,
            format!("Health check failed for {} on {}: {}", backend, route, detail),
        )
    }

    pub fn reloaded(routes: usize) -> Self {
        Self::new(
            EventKind::ConfigurationReloaded,
            format!("Configuration reloaded with {} routes", routes),
        )
    }

    pub fn reload_failed(error: &ConfigError) -> Self {
        Self::new(
            EventKind::ReloadFailed,
            format!("Configuration reload failed: {}", error),
        )
    }

    pub fn backend_removed(application: &str, backend: &str) -> Self {
        Self::new(
            EventKind::BackendRemoved,
            format!("Backend {} removed from {}", backend, application),
        )
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("event endpoint answered {status}")]
    Rejected { status: u16 },
}

/// Receives operational events (health failures, reload outcomes).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &Event) -> Result<(), EventError>;
}

/// Posts events as JSON to `{backend}/event`; the endpoint answers 201.
pub struct RestEventSink {
    client: Client,
    endpoint: String,
    access_key: String,
    secret: String,
}

impl RestEventSink {
    pub fn new(settings: &Settings) -> Result<Self, ConfigError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/event", api_base_url(&settings.api.backend)),
            access_key: settings.api.access_key.clone(),
            secret: settings.api.secret.clone(),
        })
    }
}

#[async_trait]
impl EventSink for RestEventSink {
    async fn send(&self, event: &Event) -> Result<(), EventError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("AccessKey", &self.access_key)
            .header("Secret", &self.secret)
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            return Err(EventError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Writes events to the log only; used when no API backend is configured.
#[derive(Debug, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn send(&self, event: &Event) -> Result<(), EventError> {
        info!(event_id = event.event_id, "{}", event.event_data);
        Ok(())
    }
}

pub fn sink_from_settings(settings: &Settings) -> Result<Arc<dyn EventSink>, ConfigError> {
    if settings.api.backend.trim().is_empty() {
        warn!("No API backend configured, events are only logged");
        return Ok(Arc::new(LogEventSink));
    }
    Ok(Arc::new(RestEventSink::new(settings)?))
}
