//! # devwatch-daemon - Device Daemon Supervision
//!
//! Runs the external device discovery tool, speaks its line-oriented JSON
//! protocol, and keeps track of the devices each instance reports.
//!
//! Depends on [`devwatch_core`] for message types and error handling.
//!
//! ## Public API
//!
//! ### Protocol
//! - [`ProtocolEngine`] - Command ids, response correlation, event dispatch
//! - [`ResponseHandle`] - Result of one command
//! - [`parse_and_validate()`] / [`encode_command()`] - Line framing
//!
//! ### Process Supervision
//! - [`ToolDescriptor`] / [`choose_descriptor()`] - What to launch
//! - [`ProcessSupervisor`] - Launch, handshake, bounded-retry readiness polling
//! - [`DeviceDaemon`] - A started instance
//! - [`ToolLauncher`] / [`ProcessLauncher`] - Process creation seam
//!
//! ### Devices
//! - [`Device`] / [`DeviceListSnapshot`] - Immutable device list and selection

pub mod commands;
pub mod descriptor;
pub mod devices;
pub mod engine;
pub mod launcher;
pub mod process;
pub mod protocol;
pub mod supervisor;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

// Public API re-exports
pub use commands::{DaemonCommand, RequestTracker, ResponseHandle};
pub use descriptor::{choose_descriptor, has_flutter_project, DescriptorInputs, ToolDescriptor};
pub use devices::{Device, DeviceListSnapshot};
pub use engine::{MessageListener, ProtocolEngine, STDERR_LINES_TO_KEEP};
pub use launcher::{
    wait_for_exit, ExitListener, LaunchHooks, LaunchedTool, ProcessLauncher, ProcessState,
    ToolLauncher, ToolProcess,
};
pub use process::DaemonProcess;
pub use protocol::{encode_command, is_protocol_line, parse_and_validate, InboundMessage, ParsedLine};
pub use supervisor::{
    DeviceDaemon, InstanceId, ProcessSupervisor, StartupPolicy, SupervisorHooks, WarningSink,
};

/// Re-exported from `devwatch_core` for convenience.
pub use devwatch_core::DaemonMessage;
