//! Domain event definitions

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Process Events
// ─────────────────────────────────────────────────────────

/// Raw output of a supervised tool process, in the order it was read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// One line of stdout (newline stripped)
    Stdout(String),
    /// One line of stderr (newline stripped)
    Stderr(String),
    /// The process exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
}

// ─────────────────────────────────────────────────────────
// Event Payloads
// ─────────────────────────────────────────────────────────

/// Log message from the daemon itself, used for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonLogMessage {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

/// Payload of `device.added` / `device.removed`.
///
/// Every field is optional on the wire: an event without an `id` is still
/// decoded so the consumer can report it, but it cannot target a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub emulator: bool,
}

// ─────────────────────────────────────────────────────────
// DaemonMessage Enum
// ─────────────────────────────────────────────────────────

/// The closed set of events the device daemon may send us.
///
/// Event names outside this set are dropped by the parser so newer tools keep
/// working with older watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    DeviceAdded(DeviceInfo),
    DeviceRemoved(DeviceInfo),
    LogMessage(DaemonLogMessage),
}

impl DaemonMessage {
    pub const DEVICE_ADDED: &'static str = "device.added";
    pub const DEVICE_REMOVED: &'static str = "device.removed";
    pub const LOG_MESSAGE: &'static str = "daemon.logMessage";

    /// Wire name of this event
    pub fn event_name(&self) -> &'static str {
        match self {
            DaemonMessage::DeviceAdded(_) => Self::DEVICE_ADDED,
            DaemonMessage::DeviceRemoved(_) => Self::DEVICE_REMOVED,
            DaemonMessage::LogMessage(_) => Self::LOG_MESSAGE,
        }
    }

    /// Device payload, if this is a device event
    pub fn device(&self) -> Option<&DeviceInfo> {
        match self {
            DaemonMessage::DeviceAdded(d) | DaemonMessage::DeviceRemoved(d) => Some(d),
            DaemonMessage::LogMessage(_) => None,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match self {
            DaemonMessage::DeviceAdded(d) => format!(
                "Device added: {} ({})",
                d.name.as_deref().unwrap_or("<unnamed>"),
                d.platform.as_deref().unwrap_or("unknown")
            ),
            DaemonMessage::DeviceRemoved(d) => format!(
                "Device removed: {}",
                d.name
                    .as_deref()
                    .or(d.id.as_deref())
                    .unwrap_or("<unknown>")
            ),
            DaemonMessage::LogMessage(m) => format!("[{}] {}", m.level, m.message),
        }
    }
}
