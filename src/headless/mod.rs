//! Headless output - JSON events on stdout
//!
//! devwatch reports everything it learns about devices as structured JSON
//! events, so scripts and editor integrations can follow the device list
//! without scraping text.
//!
//! # Event Format
//!
//! Events are output as NDJSON (newline-delimited JSON), one event per line.
//! Each event has an "event" field indicating its type, along with event-specific data.
//!
//! # Example Output
//!
//! ```json
//! {"event":"status","status":"loading","timestamp":1704700001000}
//! {"event":"devices","devices":[{"id":"emulator-5554","name":"Pixel 7","platform":"android-x64","emulator":true}],"selected":"emulator-5554","timestamp":1704700002000}
//! {"event":"status","status":"ready","timestamp":1704700002010}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};
use tracing::error;

use devwatch_app::{DaemonStatus, Device, DeviceListSnapshot, RegistryEvent};

/// Events emitted on stdout
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// Supervision state changed
    Status {
        status: DaemonStatus,
        timestamp: i64,
    },

    /// Device list or selection changed
    Devices {
        devices: Vec<Device>,
        selected: Option<String>,
        timestamp: i64,
    },

    /// Something the user should look at; the daemon keeps running
    Warning { message: String, timestamp: i64 },

    /// The settings file was re-read
    ConfigReloaded { timestamp: i64 },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = self.write_to(&mut stdout) {
            error!("Failed to write headless event to stdout: {}", e);
        }
    }

    /// Write this event as one NDJSON line and flush
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let json = serde_json::to_string(self)?;
        writeln!(out, "{}", json)?;
        out.flush()
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn status(status: DaemonStatus) -> Self {
        Self::Status {
            status,
            timestamp: Self::now(),
        }
    }

    pub fn devices(snapshot: &DeviceListSnapshot) -> Self {
        Self::Devices {
            devices: snapshot.devices().to_vec(),
            selected: snapshot.selected().map(|d| d.id.clone()),
            timestamp: Self::now(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
            timestamp: Self::now(),
        }
    }

    pub fn config_reloaded() -> Self {
        Self::ConfigReloaded {
            timestamp: Self::now(),
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            message: message.into(),
            fatal,
            timestamp: Self::now(),
        }
    }
}

impl From<&RegistryEvent> for HeadlessEvent {
    fn from(event: &RegistryEvent) -> Self {
        match event {
            RegistryEvent::DevicesChanged(snapshot) => Self::devices(snapshot),
            RegistryEvent::StatusChanged(status) => Self::status(*status),
            RegistryEvent::Warning { message } => Self::warning(message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devwatch_daemon::test_utils::test_device_full;
    use serde_json::Value;

    fn to_value(event: &HeadlessEvent) -> Value {
        let mut buf = Vec::new();
        event.write_to(&mut buf).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_status_event_shape() {
        let value = to_value(&HeadlessEvent::status(DaemonStatus::Ready));
        assert_eq!(value["event"], "status");
        assert_eq!(value["status"], "ready");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_devices_event_from_registry() {
        let snapshot = DeviceListSnapshot::empty()
            .with_added(test_device_full("emulator-5554", "Pixel 7", "android-x64", true))
            .with_added(test_device_full("macos", "macOS", "darwin", false));

        let event = HeadlessEvent::from(&RegistryEvent::DevicesChanged(snapshot));
        let value = to_value(&event);

        assert_eq!(value["event"], "devices");
        assert_eq!(value["selected"], "emulator-5554");
        let devices = value["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["name"], "Pixel 7");
        assert_eq!(devices[0]["emulator"], true);
        assert_eq!(devices[1]["platform"], "darwin");
    }

    #[test]
    fn test_warning_and_error_events() {
        let warning = HeadlessEvent::from(&RegistryEvent::Warning {
            message: "daemon keeps failing".into(),
        });
        let value = to_value(&warning);
        assert_eq!(value["event"], "warning");
        assert_eq!(value["message"], "daemon keeps failing");

        let value = to_value(&HeadlessEvent::error("bad command", false));
        assert_eq!(value["event"], "error");
        assert_eq!(value["fatal"], false);

        let value = to_value(&HeadlessEvent::config_reloaded());
        assert_eq!(value["event"], "config_reloaded");
    }
}
