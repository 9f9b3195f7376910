//! Test utilities for daemon types
//!
//! Provides device builders and a scripted [`FakeLauncher`] that stands in for
//! real tool processes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::commands::lock;
use crate::descriptor::ToolDescriptor;
use crate::devices::Device;
use crate::engine::ProtocolEngine;
use crate::launcher::{ExitListener, LaunchHooks, LaunchedTool, ProcessState, ToolLauncher, ToolProcess};
use devwatch_core::prelude::*;

/// Creates a test device on a physical Android phone.
pub fn test_device(id: &str, name: &str) -> Device {
    test_device_full(id, name, "android-arm64", false)
}

/// Creates a test device with full control over all fields.
pub fn test_device_full(id: &str, name: &str, platform: &str, emulator: bool) -> Device {
    Device::new(id, name, platform, emulator)
}

/// A `device.added` line for `device`
pub fn device_added_line(device: &Device) -> String {
    format!(
        r#"[{{"event":"device.added","params":{{"id":"{}","name":"{}","platform":"{}","emulator":{}}}}}]"#,
        device.id, device.name, device.platform, device.emulator
    )
}

/// A `device.removed` line for `device`
pub fn device_removed_line(device: &Device) -> String {
    format!(
        r#"[{{"event":"device.removed","params":{{"id":"{}","name":"{}","platform":"{}"}}}}]"#,
        device.id, device.name, device.platform
    )
}

/// How one scripted launch behaves
#[derive(Debug, Clone, PartialEq)]
pub enum FakeBehavior {
    /// Answers every command with `null`; exits after `daemon.shutdown`
    Ready,
    /// Has already exited by the time `launch` returns
    ExitImmediately { stderr: String },
    /// Answers the first command with an error
    Reject { error: String },
    /// Never answers
    Hang,
}

/// In-memory process driven by the test
pub struct FakeProcess {
    state_tx: watch::Sender<ProcessState>,
    engine: Arc<ProtocolEngine>,
    on_exit: Mutex<Option<ExitListener>>,
}

impl FakeProcess {
    /// Simulate the process exiting with `code`. No-op if it already exited.
    pub fn exit(&self, code: Option<i32>) {
        if self.state_tx.borrow().has_exited() {
            return;
        }
        self.state_tx.send_replace(ProcessState::Exited { code });
        self.engine.dispose();
        if let Some(on_exit) = lock(&self.on_exit).take() {
            on_exit(code);
        }
    }
}

impl ToolProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    fn kill(&self) {
        self.exit(None);
    }
}

struct FakeLaunch {
    descriptor: ToolDescriptor,
    process: Arc<FakeProcess>,
    engine: Arc<ProtocolEngine>,
    sent: Arc<Mutex<Vec<String>>>,
}

/// Launcher that plays back a script of behaviors, one per launch.
///
/// Launches past the end of the script behave as [`FakeBehavior::Ready`].
#[derive(Default)]
pub struct FakeLauncher {
    script: Mutex<VecDeque<FakeBehavior>>,
    launches: Mutex<Vec<FakeLaunch>>,
}

impl FakeLauncher {
    pub fn new(script: Vec<FakeBehavior>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// A launcher whose every launch succeeds
    pub fn ready() -> Self {
        Self::default()
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.launches).len()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        lock(&self.launches)
            .iter()
            .map(|l| l.descriptor.clone())
            .collect()
    }

    /// Process of the `index`th launch
    pub fn process(&self, index: usize) -> Arc<FakeProcess> {
        Arc::clone(&lock(&self.launches)[index].process)
    }

    /// Methods the `index`th launch has received so far
    pub fn sent_methods(&self, index: usize) -> Vec<String> {
        let sent = Arc::clone(&lock(&self.launches)[index].sent);
        let methods = lock(&sent).clone();
        methods
    }

    /// Feed a stdout line to the `index`th launch
    pub fn emit(&self, index: usize, line: &str) {
        let engine = Arc::clone(&lock(&self.launches)[index].engine);
        engine.handle_line(line);
    }

    async fn respond(
        behavior: FakeBehavior,
        mut outbound: mpsc::UnboundedReceiver<String>,
        engine: Arc<ProtocolEngine>,
        process: Arc<FakeProcess>,
        sent: Arc<Mutex<Vec<String>>>,
    ) {
        let mut answered = false;
        while let Some(line) = outbound.recv().await {
            let Ok(command) = serde_json::from_str::<Value>(&line[1..line.len() - 1]) else {
                continue;
            };
            let id = command["id"].as_u64().unwrap_or_default();
            let method = command["method"].as_str().unwrap_or_default().to_string();
            lock(&sent).push(method.clone());

            match &behavior {
                FakeBehavior::Ready => {
                    engine.handle_line(&format!(r#"[{{"id":{id},"result":null}}]"#));
                    if method == "daemon.shutdown" {
                        process.exit(Some(0));
                        return;
                    }
                }
                FakeBehavior::Reject { error } if !answered => {
                    engine.handle_line(&format!(r#"[{{"id":{id},"error":"{error}"}}]"#));
                }
                _ => {}
            }
            answered = true;
        }
    }
}

impl ToolLauncher for FakeLauncher {
    fn launch(&self, descriptor: &ToolDescriptor, hooks: LaunchHooks) -> Result<LaunchedTool> {
        let behavior = lock(&self.script)
            .pop_front()
            .unwrap_or(FakeBehavior::Ready);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(ProtocolEngine::new(outbound_tx, hooks.on_message));
        let (state_tx, _) = watch::channel(ProcessState::Running);
        let process = Arc::new(FakeProcess {
            state_tx,
            engine: Arc::clone(&engine),
            on_exit: Mutex::new(Some(hooks.on_exit)),
        });
        let sent = Arc::new(Mutex::new(Vec::new()));

        if let FakeBehavior::ExitImmediately { stderr } = &behavior {
            engine.append_stderr(stderr);
            // Exited without disposing, like a real process whose exit has not
            // been pumped yet
            process.state_tx.send_replace(ProcessState::Exited { code: Some(1) });
            if let Some(on_exit) = lock(&process.on_exit).take() {
                on_exit(Some(1));
            }
        }

        tokio::spawn(Self::respond(
            behavior,
            outbound_rx,
            Arc::clone(&engine),
            Arc::clone(&process),
            Arc::clone(&sent),
        ));

        lock(&self.launches).push(FakeLaunch {
            descriptor: descriptor.clone(),
            process: Arc::clone(&process),
            engine: Arc::clone(&engine),
            sent,
        });

        Ok(LaunchedTool { process, engine })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_basic() {
        let device = test_device("test-id", "Test Device");
        assert_eq!(device.id, "test-id");
        assert_eq!(device.name, "Test Device");
        assert!(!device.emulator);
    }

    #[test]
    fn test_device_lines_are_protocol_lines() {
        let device = test_device_full("emulator-5554", "Pixel 7", "android-x64", true);
        let added = device_added_line(&device);
        assert!(crate::protocol::is_protocol_line(&added));
        assert!(added.contains(r#""emulator":true"#));
        assert!(crate::protocol::is_protocol_line(&device_removed_line(&device)));
    }

    #[tokio::test]
    async fn test_fake_process_exit_runs_hook_once() {
        let launcher = FakeLauncher::ready();
        let exits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&exits);
        let hooks = LaunchHooks {
            on_message: Box::new(|_| {}),
            on_exit: Box::new(move |_| *counter.lock().unwrap() += 1),
        };
        let launched = launcher
            .launch(&ToolDescriptor::new("/", "fake"), hooks)
            .unwrap();

        launcher.process(0).exit(Some(3));
        launched.process.kill();
        assert_eq!(*exits.lock().unwrap(), 1);
        assert_eq!(launched.process.state(), ProcessState::Exited { code: Some(3) });
        assert!(launched.engine.is_disposed());
    }
}
