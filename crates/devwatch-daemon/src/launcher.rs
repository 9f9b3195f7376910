//! The seam between supervision and real child processes

use std::sync::Arc;

use tokio::sync::watch;

use crate::descriptor::ToolDescriptor;
use crate::engine::{MessageListener, ProtocolEngine};
use crate::process::DaemonProcess;
use devwatch_core::prelude::*;

/// Called once when the process exits, after its output has been drained
pub type ExitListener = Box<dyn FnOnce(Option<i32>) + Send>;

/// Lifecycle of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// `code` is `None` when the process was killed by a signal
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn has_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }
}

/// A running (or finished) tool process
pub trait ToolProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Observe state changes
    fn watch_state(&self) -> watch::Receiver<ProcessState>;

    /// Request termination. Idempotent; a no-op once the process has exited.
    fn kill(&self);

    fn state(&self) -> ProcessState {
        let rx = self.watch_state();
        let state = *rx.borrow();
        state
    }

    fn has_exited(&self) -> bool {
        self.state().has_exited()
    }
}

/// Wait until the process has exited
pub async fn wait_for_exit(process: &dyn ToolProcess) -> ProcessState {
    let mut rx = process.watch_state();
    let state = match rx.wait_for(ProcessState::has_exited).await {
        Ok(state) => *state,
        // Sender gone without an exit being recorded
        Err(_) => ProcessState::Exited { code: None },
    };
    state
}

/// Callbacks wired into a launched tool
pub struct LaunchHooks {
    pub on_message: MessageListener,
    pub on_exit: ExitListener,
}

/// A launched process plus the engine speaking to it
pub struct LaunchedTool {
    pub process: Arc<dyn ToolProcess>,
    pub engine: Arc<ProtocolEngine>,
}

/// Starts tool processes from descriptors
pub trait ToolLauncher: Send + Sync {
    fn launch(&self, descriptor: &ToolDescriptor, hooks: LaunchHooks) -> Result<LaunchedTool>;
}

/// Launches real child processes with piped stdio
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ToolLauncher for ProcessLauncher {
    fn launch(&self, descriptor: &ToolDescriptor, hooks: LaunchHooks) -> Result<LaunchedTool> {
        let (process, engine) = DaemonProcess::spawn(descriptor, hooks)?;
        Ok(LaunchedTool {
            process: Arc::new(process),
            engine,
        })
    }
}
