//! Layered settings: a TOML file overridden by `AGENT_BRIDGE_*` environment variables

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::agents::RuntimeConfig;
use crate::bridge::{BridgeConfig, EngineKind, ResourceLimits, DEFAULT_TIMEOUT};
use crate::domain::PlatformConstraints;

pub const ENV_PREFIX: &str = "AGENT_BRIDGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration validation failed:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub platform: PlatformConstraints,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    /// Unset keeps tool failures local to the conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_after_consecutive_tool_failures: Option<u32>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            max_continuations: default_max_continuations(),
            default_timeout_ms: None,
            escalate_after_consecutive_tool_failures: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stack_depth: Option<usize>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            timeout_ms: default_bridge_timeout_ms(),
            memory_limit_bytes: None,
            max_stack_depth: None,
        }
    }
}

fn default_server_id() -> String {
    RuntimeConfig::default().server_id
}

fn default_max_continuations() -> u32 {
    RuntimeConfig::default().max_continuations
}

fn default_bridge_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    /// Load from `path` (missing file is fine) and the process environment
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    pub(crate) fn load_with_env(path: impl AsRef<Path>, env: Environment) -> ConfigResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// All problems at once, one message per field
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if self.runtime.server_id.trim().is_empty() {
            errors.push("runtime.server_id must not be empty".to_string());
        }
        if self.runtime.default_timeout_ms == Some(0) {
            errors.push("runtime.default_timeout_ms must be greater than 0".to_string());
        }
        if self.runtime.escalate_after_consecutive_tool_failures == Some(0) {
            errors.push(
                "runtime.escalate_after_consecutive_tool_failures must be greater than 0"
                    .to_string(),
            );
        }
        if self.platform.max_concurrent_bridges == 0 {
            errors.push("platform.max_concurrent_bridges must be greater than 0".to_string());
        }
        if self.bridge.timeout_ms == 0 {
            errors.push("bridge.timeout_ms must be greater than 0".to_string());
        }
        if self.bridge.memory_limit_bytes == Some(0) {
            errors.push("bridge.memory_limit_bytes must be greater than 0".to_string());
        }
        if self.bridge.max_stack_depth == Some(0) {
            errors.push("bridge.max_stack_depth must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            server_id: self.runtime.server_id.clone(),
            max_continuations: self.runtime.max_continuations,
            default_timeout: self.runtime.default_timeout_ms.map(Duration::from_millis),
            escalate_after_consecutive_tool_failures: self
                .runtime
                .escalate_after_consecutive_tool_failures,
        }
    }

    pub fn platform_constraints(&self) -> PlatformConstraints {
        self.platform
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_millis(self.bridge.timeout_ms),
            memory_limit_bytes: self.bridge.memory_limit_bytes,
            max_stack_depth: self.bridge.max_stack_depth,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            engine: self.bridge.engine,
            limits: self.resource_limits(),
        }
    }
}
