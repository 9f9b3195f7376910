//! Connected devices and the immutable device-list snapshot

use serde::Serialize;

use devwatch_core::prelude::*;
use devwatch_core::{DaemonMessage, DeviceInfo};

/// A connected device as reported by the daemon.
///
/// Equality covers `id`, `name` and `platform`, so a renamed device is a
/// different value.
#[derive(Debug, Clone, Eq, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub emulator: bool,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.platform == other.platform
    }
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        platform: impl Into<String>,
        emulator: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            platform: platform.into(),
            emulator,
        }
    }

    /// Build from an event payload. `None` when the payload has no id.
    pub fn from_info(info: &DeviceInfo) -> Option<Self> {
        let id = info.id.clone()?;
        Some(Self {
            name: info.name.clone().unwrap_or_else(|| id.clone()),
            platform: info.platform.clone().unwrap_or_default(),
            emulator: info.emulator,
            id,
        })
    }

    /// Get a display string for the device
    pub fn display_name(&self) -> String {
        if self.emulator {
            format!("{} (emulator)", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Devices sorted by name plus the current selection.
///
/// Every transition returns a new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceListSnapshot {
    devices: Vec<Device>,
    selected: Option<Device>,
}

impl DeviceListSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn selected(&self) -> Option<&Device> {
        self.selected.as_ref()
    }

    pub fn find(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn sorted(mut devices: Vec<Device>) -> Vec<Device> {
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Add or replace a device.
    ///
    /// With nothing selected, the first device of the sorted list becomes the
    /// selection. A selected device that is replaced stays selected under its
    /// new value.
    pub fn with_added(&self, device: Device) -> Self {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| d.id != device.id)
            .cloned()
            .collect();
        devices.push(device.clone());
        let devices = Self::sorted(devices);

        let selected = match &self.selected {
            Some(current) if current.id == device.id => Some(device),
            Some(current) => Some(current.clone()),
            None => devices.first().cloned(),
        };

        Self { devices, selected }
    }

    /// Remove a device; clears the selection if it was the selected one
    pub fn with_removed(&self, id: &str) -> Self {
        let devices = self
            .devices
            .iter()
            .filter(|d| d.id != id)
            .cloned()
            .collect();
        let selected = self.selected.clone().filter(|d| d.id != id);
        Self { devices, selected }
    }

    /// Select the device with `id`; unchanged if there is none
    pub fn with_selection(&self, id: &str) -> Self {
        match self.find(id) {
            Some(device) => Self {
                devices: self.devices.clone(),
                selected: Some(device.clone()),
            },
            None => self.clone(),
        }
    }

    /// Replace the whole list.
    ///
    /// Keeps the selection if its id is still present, else selects the first
    /// device.
    pub fn with_devices(&self, devices: Vec<Device>) -> Self {
        let devices = Self::sorted(devices);
        let selected = self
            .selected
            .as_ref()
            .and_then(|s| devices.iter().find(|d| d.id == s.id))
            .or_else(|| devices.first())
            .cloned();
        Self { devices, selected }
    }

    /// Apply a device event.
    ///
    /// Returns `None` for events that do not change the list, including device
    /// events without an id.
    pub fn apply(&self, message: &DaemonMessage) -> Option<Self> {
        match message {
            DaemonMessage::DeviceAdded(info) => match Device::from_info(info) {
                Some(device) => Some(self.with_added(device)),
                None => {
                    warn!("device.added event has no id; ignoring {:?}", info.name);
                    None
                }
            },
            DaemonMessage::DeviceRemoved(info) => match info.id.as_deref() {
                Some(id) => Some(self.with_removed(id)),
                None => {
                    warn!("device.removed event has no id; ignoring {:?}", info.name);
                    None
                }
            },
            DaemonMessage::LogMessage(_) => None,
        }
    }
}
