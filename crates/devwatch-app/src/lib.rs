//! devwatch-app - Device registry and configuration for devwatch
//!
//! Builds the long-lived pieces on top of `devwatch-daemon`: the delivery
//! context every notification runs on, the single-flight [`Refreshable`]
//! cache, the [`DeviceRegistry`] that owns the current device daemon, and the
//! settings file with its watcher.

pub mod config;
pub mod delivery;
pub mod refreshable;
pub mod registry;
pub mod watcher;

// Re-export primary types
pub use config::{ConfigDescriptorSource, Settings};
pub use delivery::{invoke_guarded, DeliveryContext};
pub use refreshable::{CancellationToken, ListenerId, RefreshState, Refreshable, Request};
pub use registry::{
    DaemonStatus, DescriptorSource, DeviceRegistry, RegistryConfig, RegistryEvent,
    SubscriptionId,
};
pub use watcher::{ConfigEvent, ConfigWatcher};

// Re-export daemon types for front ends
pub use devwatch_daemon::{Device, DeviceListSnapshot, ProcessLauncher};
