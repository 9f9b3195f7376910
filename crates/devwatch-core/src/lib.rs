//! # devwatch-core - Shared Foundation
//!
//! Foundation crate for devwatch. Provides the error taxonomy, logging
//! bootstrap and the typed messages of the device daemon protocol.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Events (`events`)
//! - [`DaemonMessage`] - The closed vocabulary of events sent by the device daemon
//! - [`DeviceInfo`] - Payload of `device.added` / `device.removed`
//! - [`DaemonEvent`] - Raw stdout/stderr/exit output of a supervised process
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum covering protocol, remote, startup and exit failures
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use devwatch_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;

pub use error::{Error, Result, ResultExt};
pub use events::{DaemonEvent, DaemonLogMessage, DaemonMessage, DeviceInfo};
