//! Configuration types for devwatch
//!
//! Defines:
//! - `Settings` - Contents of `.devwatch/config.toml`
//! - One struct per section, each with serde defaults

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use devwatch_daemon::StartupPolicy;

use crate::registry::RegistryConfig;

/// Project settings from `.devwatch/config.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub tool: ToolSettings,

    #[serde(default)]
    pub workspace: WorkspaceSettings,

    /// Extra environment for the daemon process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub startup: StartupSettings,

    #[serde(default)]
    pub registry: RegistrySettings,
}

/// Where the Flutter tool comes from
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolSettings {
    /// SDK home; relative paths are resolved against the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_path: Option<PathBuf>,

    /// Ask the daemon to report its synthetic test device
    #[serde(default)]
    pub show_test_device: bool,

    /// Look for `flutter` on PATH when `sdk_path` is unset
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            sdk_path: None,
            show_test_device: false,
            search_path: true,
        }
    }
}

/// A build workspace that ships its own daemon script
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct WorkspaceSettings {
    /// Workspace root; defaults to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Script that speaks the daemon protocol, relative to the workspace root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_script: Option<PathBuf>,
}

/// Readiness polling
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StartupSettings {
    #[serde(default = "default_short_poll_ms")]
    pub short_poll_ms: u64,

    #[serde(default = "default_long_poll_ms")]
    pub long_poll_ms: u64,

    #[serde(default = "default_slow_poll_after")]
    pub slow_poll_after: u32,

    #[serde(default = "default_warn_after")]
    pub warn_after: u32,

    /// 0 = retry forever
    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            short_poll_ms: default_short_poll_ms(),
            long_poll_ms: default_long_poll_ms(),
            slow_poll_after: default_slow_poll_after(),
            warn_after: default_warn_after(),
            max_attempts: 0,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

/// Restart behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistrySettings {
    #[serde(default = "default_restart_cooldown_secs")]
    pub restart_cooldown_secs: u64,

    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            restart_cooldown_secs: default_restart_cooldown_secs(),
            restart_delay_secs: default_restart_delay_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_short_poll_ms() -> u64 {
    100
}

fn default_long_poll_ms() -> u64 {
    1000
}

fn default_slow_poll_after() -> u32 {
    10
}

fn default_warn_after() -> u32 {
    100
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_restart_cooldown_secs() -> u64 {
    20
}

fn default_restart_delay_secs() -> u64 {
    4
}

impl Settings {
    pub fn startup_policy(&self) -> StartupPolicy {
        StartupPolicy {
            short_poll: Duration::from_millis(self.startup.short_poll_ms),
            long_poll: Duration::from_millis(self.startup.long_poll_ms),
            slow_poll_after: self.startup.slow_poll_after,
            warn_after: self.startup.warn_after,
            max_attempts: match self.startup.max_attempts {
                0 => None,
                n => Some(n),
            },
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            startup: self.startup_policy(),
            settle_delay: Duration::from_millis(self.startup.settle_delay_ms),
            restart_cooldown: Duration::from_secs(self.registry.restart_cooldown_secs),
            restart_delay: Duration::from_secs(self.registry.restart_delay_secs),
        }
    }
}
