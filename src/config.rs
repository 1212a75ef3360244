use crate::error::{CallError, Result};
use crate::peer::state::{DATA_CHANNEL_LABEL, GRACE_PERIOD_SECS};
use crate::peer::types::{MediaConstraints, ServerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Логирование по умолчанию включено только в режиме разработки
#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Время ожидания ответа на исходящий вызов
pub const REQUEST_TIMEOUT_SECS: u64 = 45;

/// Coordinator and engine settings, loadable from JSON
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Our own identity on the secure channel. Enables the glare tie-break.
    pub local_peer_id: Option<String>,
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConstraints,
    pub data_channel_label: String,
    /// Cancel outgoing calls that are not established in time; `None` waits forever
    pub request_timeout_secs: Option<u64>,
    /// How long a disconnected connection may recover before the call fails
    pub disconnect_grace_secs: u64,
    pub event_capacity: usize,
    pub logging: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_peer_id: None,
            ice_servers: default_ice_servers(),
            media: MediaConstraints::default(),
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            request_timeout_secs: Some(REQUEST_TIMEOUT_SECS),
            disconnect_grace_secs: GRACE_PERIOD_SECS,
            event_capacity: 256,
            logging: LOGGING_ENABLED,
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_local_peer_id(mut self, id: impl Into<String>) -> Self {
        self.local_peer_id = Some(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::Config(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
                return Err(CallError::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.data_channel_label.is_empty() {
            return Err(CallError::Config("data channel label is empty".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(CallError::Config("event capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

/// Дефолтные серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}
