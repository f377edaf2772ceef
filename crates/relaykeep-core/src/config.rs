//! Startup configuration: engine tuning plus one record per session.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

pub const WILDCARD_SENDER: &str = "*";

pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "/tp", "/msg", "/say", "/warp", "/home", "/spawn", "/tpa", "/tpaccept", "/tpdeny", "/me",
];

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RelaykeepConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

/// Process-wide tuning constants, read-only after startup.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub command_cooldown_ms: u64,
    pub max_command_length: usize,
    pub login_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub start_stagger_ms: u64,
    pub send_gap_ms: u64,
    pub queue_capacity: usize,
    pub not_writable_retry_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub cooldown_sweep_interval_ms: u64,
    pub cooldown_max_age_ms: u64,
    pub allowed_commands: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_cooldown_ms: 3_000,
            max_command_length: 200,
            login_timeout_ms: 20_000,
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_ms: 2_000,
            start_stagger_ms: 9_000,
            send_gap_ms: 100,
            queue_capacity: 10,
            not_writable_retry_ms: 1_000,
            keep_alive_interval_ms: 30_000,
            cooldown_sweep_interval_ms: 60_000,
            cooldown_max_age_ms: 300_000,
            allowed_commands: DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn command_cooldown(&self) -> Duration {
        Duration::from_millis(self.command_cooldown_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn cooldown_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cooldown_sweep_interval_ms)
    }

    pub fn cooldown_max_age(&self) -> Duration {
        Duration::from_millis(self.cooldown_max_age_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("engine.queue_capacity must be at least 1"));
        }
        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConfigError::invalid(
                "engine.reconnect_base_ms must not exceed engine.reconnect_max_ms",
            ));
        }
        if let Some(bad) = self.allowed_commands.iter().find(|c| !c.starts_with('/')) {
            return Err(ConfigError::invalid(format!(
                "allowed command '{bad}' must start with '/'"
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StatusConfig {
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: String,
    #[serde(default)]
    pub fallback_address: Option<String>,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Either a username or [`WILDCARD_SENDER`]. Defaults to `admin_user`.
    #[serde(default)]
    pub allowed_sender: Option<String>,
    pub admin_user: String,
    #[serde(default)]
    pub auto_activate_item: bool,
}

impl SessionConfig {
    pub fn allowed_sender(&self) -> &str {
        self.allowed_sender.as_deref().unwrap_or(&self.admin_user)
    }

    fn validate(&self, index: usize) -> Result<()> {
        let field_missing = |field: &str| {
            ConfigError::invalid(format!("sessions[{index}].{field} must not be empty"))
        };
        if self.username.trim().is_empty() {
            return Err(field_missing("username"));
        }
        if self.host.trim().is_empty() {
            return Err(field_missing("host"));
        }
        if self.admin_user.trim().is_empty() {
            return Err(field_missing("admin_user"));
        }
        Ok(())
    }
}

impl RelaykeepConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            return Err(ConfigError::invalid("at least one [[sessions]] entry is required"));
        }
        self.engine.validate()?;
        for (index, session) in self.sessions.iter().enumerate() {
            session.validate(index)?;
        }
        Ok(())
    }
}
