//! Settings parser for .devwatch/config.toml

use super::types::Settings;
use devwatch_core::prelude::*;
use devwatch_daemon::descriptor::{choose_descriptor, has_flutter_project, DescriptorInputs};
use devwatch_daemon::ToolDescriptor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::refreshable::lock;
use crate::registry::DescriptorSource;

const CONFIG_FILENAME: &str = "config.toml";
pub const DEVWATCH_DIR: &str = ".devwatch";

/// Location of the settings file for `project_path`
pub fn config_path(project_path: &Path) -> PathBuf {
    project_path.join(DEVWATCH_DIR).join(CONFIG_FILENAME)
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load settings from .devwatch/config.toml
///
/// Returns default settings if file doesn't exist or can't be parsed.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = config_path(project_path);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Create a commented default config in .devwatch/
pub fn init_config_dir(project_path: &Path) -> Result<PathBuf> {
    if !project_path.is_dir() {
        return Err(Error::config(format!(
            "{} is not a directory",
            project_path.display()
        )));
    }

    let devwatch_dir = project_path.join(DEVWATCH_DIR);
    if !devwatch_dir.exists() {
        std::fs::create_dir_all(&devwatch_dir)
            .with_context(|| format!("Failed to create {}", devwatch_dir.display()))?;
    }

    let config_path = devwatch_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        std::fs::write(&config_path, generate_default_config())
            .context("Failed to write config.toml")?;
        info!("Wrote default settings to {:?}", config_path);
    }

    Ok(config_path)
}

fn generate_default_config() -> String {
    r#"# devwatch configuration

[tool]
# Flutter SDK home. Leave unset to find `flutter` on PATH.
# sdk_path = "/opt/flutter"
show_test_device = false
search_path = true

[workspace]
# Used when no SDK is configured: a script speaking the daemon protocol
# root = "."
# daemon_script = "tools/device_daemon.sh"

[env]
# Extra environment for the daemon
# ANDROID_HOME = "/opt/android-sdk"

[startup]
short_poll_ms = 100
long_poll_ms = 1000
slow_poll_after = 10
warn_after = 100        # Failed attempts before a warning is shown
max_attempts = 0        # 0 = keep retrying
settle_delay_ms = 100

[registry]
restart_cooldown_secs = 20
restart_delay_secs = 4
"#
    .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor Source
// ─────────────────────────────────────────────────────────────────────────────

/// Decides the daemon to run from the project's settings file
pub struct ConfigDescriptorSource {
    project_root: PathBuf,
    settings: Mutex<Settings>,
}

impl ConfigDescriptorSource {
    pub fn load(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let settings = load_settings(&project_root);
        Self {
            project_root,
            settings: Mutex::new(settings),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }

    /// Re-read the settings file. Returns true if anything changed.
    pub fn reload(&self) -> bool {
        let next = load_settings(&self.project_root);
        let mut settings = lock(&self.settings);
        if *settings == next {
            return false;
        }
        *settings = next;
        true
    }

    /// Resolve the settings against the file system
    pub fn inputs(&self) -> DescriptorInputs {
        let settings = self.settings();
        let workspace_root = settings
            .workspace
            .root
            .as_deref()
            .map(|root| canonical(self.project_root.join(root)))
            .unwrap_or_else(|| self.project_root.clone());

        DescriptorInputs {
            sdk_path: self.resolve_sdk(&settings),
            has_flutter_project: has_flutter_project(&self.project_root),
            show_test_device: settings.tool.show_test_device,
            workspace_root: Some(workspace_root),
            daemon_script: settings.workspace.daemon_script.clone(),
            env: settings.env.clone(),
        }
    }

    fn resolve_sdk(&self, settings: &Settings) -> Option<PathBuf> {
        if let Some(sdk) = &settings.tool.sdk_path {
            return Some(canonical(self.project_root.join(sdk)));
        }
        if !settings.tool.search_path {
            return None;
        }
        find_sdk_on_path()
    }
}

impl DescriptorSource for ConfigDescriptorSource {
    fn descriptor(&self) -> Option<ToolDescriptor> {
        choose_descriptor(&self.inputs())
    }
}

/// SDK home of the `flutter` found on PATH (`<sdk>/bin/flutter`)
pub fn find_sdk_on_path() -> Option<PathBuf> {
    let flutter = which::which("flutter").ok()?;
    let flutter = canonical(flutter);
    let sdk = flutter.parent()?.parent()?.to_path_buf();
    debug!("Found Flutter SDK on PATH: {}", sdk.display());
    Some(sdk)
}

fn canonical(path: PathBuf) -> PathBuf {
    dunce::canonicalize(&path).unwrap_or(path)
}
