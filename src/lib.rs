//! device-watch library
//!
//! Front end for the devwatch crates: runs the device registry for one
//! project and reports devices as NDJSON on stdout.

pub mod headless;

// Re-export main entry points
pub use headless::runner::run_headless;
