// src/control/message.rs
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, HealthCheckSettings};

/// Payload of a join or leave message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MembershipBody {
    pub application: String,
    /// Backend URL joining or leaving.
    pub target: String,
    pub healthcheck: Option<HealthCheckSettings>,
    /// Path prefixes served by the application when it is created by this
    /// join; the application name is used when empty.
    pub routes: Vec<String>,
    pub order: i64,
    /// Strategy name for a newly created balancer.
    pub method: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Join(MembershipBody),
    Leave(MembershipBody),
    Reload,
}

impl ControlMessage {
    /// Decodes a message published on `/loadbalancer/<application>/join`,
    /// `/loadbalancer/<application>/leave` or `/loadbalancer/reload`.
    ///
    /// The subject names the application when the body leaves it empty.
    pub fn parse(subject: &str, payload: &[u8]) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = subject
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();

        match parts.as_slice() {
            ["loadbalancer", "reload"] => Ok(Self::Reload),
            ["loadbalancer", application, action @ ("join" | "leave")] => {
                let mut body: MembershipBody = serde_json::from_slice(payload)
                    .map_err(|e| ConfigError::InvalidMessage(format!("{}: {}", subject, e)))?;
                if body.application.is_empty() {
                    body.application = application.to_string();
                }
                if body.target.is_empty() {
                    return Err(ConfigError::InvalidMessage(format!(
                        "{}: missing Target",
                        subject
                    )));
                }
                Ok(if *action == "join" {
                    Self::Join(body)
                } else {
                    Self::Leave(body)
                })
            }
            _ => Err(ConfigError::InvalidMessage(format!(
                "unknown subject {}",
                subject
            ))),
        }
    }

    pub fn application(&self) -> Option<&str> {
        match self {
            Self::Join(body) | Self::Leave(body) => Some(&body.application),
            Self::Reload => None,
        }
    }
}
