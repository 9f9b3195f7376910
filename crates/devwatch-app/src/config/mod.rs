//! Configuration file parsing for devwatch
//!
//! Supports:
//! - `.devwatch/config.toml` - Project settings

pub mod settings;
pub mod types;

pub use settings::{
    config_path, find_sdk_on_path, init_config_dir, load_settings, ConfigDescriptorSource,
    DEVWATCH_DIR,
};
pub use types::*;
