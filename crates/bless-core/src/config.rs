//! Server configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::advertisement::AdvertisementData;
use crate::backend::BackendKind;
use crate::errors::{BlessError, Result};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a [`BlessServer`](crate::BlessServer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Advertised local name; also names the BlueZ application object
    pub name: String,
    /// Force a backend instead of the host default (WinRT vs DotNet, simulated)
    pub backend: Option<BackendKind>,
    /// Maximum wait for the radio to report powered on
    pub powered_on_timeout_ms: u64,
    /// Maximum wait for the native stack to confirm advertising started
    pub advertising_timeout_ms: u64,
    /// Automatic re-runs of the start sequence after an advertising timeout
    pub start_retries: u32,
    /// Keep the full local name over the service UUID list when both don't
    /// fit; when false the UUID list wins and the name is omitted
    pub name_priority: bool,
    /// Optional advertisement fields
    pub advertisement: Option<AdvertisementData>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "bless".to_string(),
            backend: None,
            powered_on_timeout_ms: 10_000,
            advertising_timeout_ms: 2_000,
            start_retries: 1,
            name_priority: true,
            advertisement: None,
        }
    }
}

impl ServerConfig {
    /// Create a configuration advertising under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(input).map_err(|e| BlessError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BlessError::InvalidConfig {
                reason: "server name must not be empty".to_string(),
            });
        }
        if self.powered_on_timeout_ms == 0 || self.advertising_timeout_ms == 0 {
            return Err(BlessError::InvalidConfig {
                reason: "timeouts must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn powered_on_timeout(&self) -> Duration {
        Duration::from_millis(self.powered_on_timeout_ms)
    }

    pub fn advertising_timeout(&self) -> Duration {
        Duration::from_millis(self.advertising_timeout_ms)
    }

    /// Set the backend override
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set powered-on timeout
    pub fn with_powered_on_timeout(mut self, timeout: Duration) -> Self {
        self.powered_on_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set advertising start timeout
    pub fn with_advertising_timeout(mut self, timeout: Duration) -> Self {
        self.advertising_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_start_retries(mut self, retries: u32) -> Self {
        self.start_retries = retries;
        self
    }

    pub fn with_name_priority(mut self, enabled: bool) -> Self {
        self.name_priority = enabled;
        self
    }

    pub fn with_advertisement(mut self, data: AdvertisementData) -> Self {
        self.advertisement = Some(data);
        self
    }
}
