//! Starting, validating and tearing down device daemon instances

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devwatch_core::prelude::*;
use devwatch_core::DaemonMessage;

use crate::commands::{lock, DaemonCommand};
use crate::descriptor::ToolDescriptor;
use crate::devices::{Device, DeviceListSnapshot};
use crate::engine::ProtocolEngine;
use crate::launcher::{self, LaunchHooks, LaunchedTool, ToolLauncher, ToolProcess};

/// Readiness polling parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPolicy {
    /// Handshake wait per iteration while attempts are low
    pub short_poll: Duration,
    /// Handshake wait per iteration once a persistent problem is suspected
    pub long_poll: Duration,
    /// Attempt count at which polling slows down
    pub slow_poll_after: u32,
    /// Failed attempts tolerated before a user-visible warning
    pub warn_after: u32,
    /// Give up after this many failed attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            short_poll: Duration::from_millis(100),
            long_poll: Duration::from_millis(1000),
            slow_poll_after: 10,
            warn_after: 100,
            max_attempts: None,
        }
    }
}

impl StartupPolicy {
    pub fn poll_interval(&self, attempts: u32) -> Duration {
        if attempts < self.slow_poll_after {
            self.short_poll
        } else {
            self.long_poll
        }
    }
}

/// Identity of one supervised instance, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "daemon#{}", self.0)
    }
}

pub type InstanceMessageListener = Arc<dyn Fn(InstanceId, DaemonMessage) + Send + Sync>;
pub type InstanceExitListener = Arc<dyn Fn(InstanceId, Option<i32>) + Send + Sync>;
pub type WarningSink = Arc<dyn Fn(String) + Send + Sync>;

/// Where supervised instances report to
#[derive(Clone)]
pub struct SupervisorHooks {
    /// Every decoded event, tagged with the instance it came from
    pub on_message: InstanceMessageListener,
    /// Exit of a started instance that was not shut down on purpose
    pub on_exit: InstanceExitListener,
    /// User-visible warnings
    pub on_warning: WarningSink,
}

impl SupervisorHooks {
    /// Hooks that only log
    pub fn logging() -> Self {
        Self {
            on_message: Arc::new(|id: InstanceId, msg: DaemonMessage| {
                debug!("{}: {}", id, msg.summary())
            }),
            on_exit: Arc::new(|id: InstanceId, code: Option<i32>| {
                info!("{} exited with {:?}", id, code)
            }),
            on_warning: Arc::new(|message: String| warn!("{}", message)),
        }
    }
}

/// State shared between an instance and the callbacks of its process
#[derive(Default)]
struct InstanceState {
    devices: Mutex<DeviceListSnapshot>,
    /// Set once startup hands the instance to its owner
    started: AtomicBool,
    /// Cleared by an explicit shutdown
    running: AtomicBool,
}

/// A started device daemon.
///
/// The descriptor never changes; a configuration change produces a new
/// instance. Equality is identity.
pub struct DeviceDaemon {
    id: InstanceId,
    descriptor: ToolDescriptor,
    process: Arc<dyn ToolProcess>,
    engine: Arc<ProtocolEngine>,
    state: Arc<InstanceState>,
}

impl DeviceDaemon {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// True until shut down or until the process exits
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire) && !self.process.has_exited()
    }

    /// Devices this instance has reported so far, sorted by name
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.state.devices).devices().to_vec()
    }

    pub fn stderr_tail(&self) -> String {
        self.engine.stderr_tail()
    }

    /// True iff this instance cannot serve `next`
    pub fn needs_restart(&self, next: &ToolDescriptor) -> bool {
        !self.is_running() || self.descriptor != *next
    }

    /// Stop the instance. Idempotent, and safe after the process has exited.
    pub fn shutdown(&self) {
        if self.state.running.swap(false, Ordering::AcqRel) {
            info!("Shutting down {} ({})", self.id, self.descriptor);
        }
        self.process.kill();
        self.engine.dispose();
    }

    /// Ask the daemon to exit, force-killing it after `grace`
    pub async fn shutdown_gracefully(&self, grace: Duration) {
        if !self.state.running.swap(false, Ordering::AcqRel) || self.process.has_exited() {
            self.shutdown();
            return;
        }

        info!("Stopping {} gracefully", self.id);
        if let Err(e) = self.engine.send_command(DaemonCommand::Shutdown) {
            debug!("daemon.shutdown not sent: {}", e);
        }

        match tokio::time::timeout(grace, launcher::wait_for_exit(self.process.as_ref())).await {
            Ok(state) => info!("{} stopped: {:?}", self.id, state),
            Err(_) => warn!("Timeout waiting for {} to exit, killing it", self.id),
        }
        self.shutdown();
    }
}

impl PartialEq for DeviceDaemon {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceDaemon {}

impl std::fmt::Debug for DeviceDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDaemon")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("pid", &self.pid())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Starts device daemons and waits for them to become ready
pub struct ProcessSupervisor {
    launcher: Arc<dyn ToolLauncher>,
    policy: StartupPolicy,
    hooks: SupervisorHooks,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        policy: StartupPolicy,
        hooks: SupervisorHooks,
    ) -> Self {
        Self {
            launcher,
            policy,
            hooks,
        }
    }

    pub fn policy(&self) -> &StartupPolicy {
        &self.policy
    }

    /// True iff `existing` is gone or was started for a different descriptor
    pub fn needs_restart(existing: &DeviceDaemon, next: &ToolDescriptor) -> bool {
        existing.needs_restart(next)
    }

    pub fn shutdown(instance: &DeviceDaemon) {
        instance.shutdown();
    }

    fn launch(
        &self,
        id: InstanceId,
        descriptor: &ToolDescriptor,
    ) -> Result<(LaunchedTool, Arc<InstanceState>)> {
        let state = Arc::new(InstanceState::default());
        state.running.store(true, Ordering::Release);

        let on_message = {
            let state = Arc::clone(&state);
            let forward = Arc::clone(&self.hooks.on_message);
            Box::new(move |message: DaemonMessage| {
                {
                    let mut devices = lock(&state.devices);
                    if let Some(next) = devices.apply(&message) {
                        *devices = next;
                    }
                }
                forward(id, message);
            })
        };

        let on_exit = {
            let state = Arc::clone(&state);
            let forward = Arc::clone(&self.hooks.on_exit);
            Box::new(move |code: Option<i32>| {
                let unexpected = state.started.load(Ordering::Acquire)
                    && state.running.load(Ordering::Acquire);
                if unexpected {
                    forward(id, code);
                } else {
                    debug!("{} exited with {:?}", id, code);
                }
            })
        };

        let launched = self.launcher.launch(
            descriptor,
            LaunchHooks {
                on_message,
                on_exit,
            },
        )?;
        Ok((launched, state))
    }

    /// Launch `descriptor` and wait for the handshake.
    ///
    /// A process that exits before the handshake is relaunched; startup keeps
    /// retrying until it succeeds, `is_cancelled` returns true, or the policy's
    /// attempt limit is reached. One warning carrying the stderr tail is raised
    /// on the first attempt past `warn_after`.
    pub async fn start<C>(&self, descriptor: ToolDescriptor, is_cancelled: C) -> Result<DeviceDaemon>
    where
        C: Fn() -> bool,
    {
        let id = InstanceId::next();
        let (mut launched, mut state) = self.launch(id, &descriptor)?;
        let mut ready = launched.engine.send_command(DaemonCommand::EnableDevices)?;

        let mut attempts: u32 = 0;
        let mut warned = false;
        let mut handshake_lost = false;

        loop {
            if is_cancelled() {
                debug!("Startup of {} cancelled", id);
                state.running.store(false, Ordering::Release);
                launched.process.kill();
                launched.engine.dispose();
                return Err(Error::Cancelled);
            }

            if handshake_lost || launched.process.has_exited() {
                handshake_lost = false;
                attempts += 1;
                let stderr = launched.engine.stderr_tail();

                if attempts > self.policy.warn_after && !warned {
                    warned = true;
                    let message = format!(
                        "The device daemon has failed to start {} times and is still retrying: {}\n{}",
                        attempts, descriptor, stderr
                    );
                    warn!("{}", message);
                    (self.hooks.on_warning)(message);
                } else {
                    debug!(
                        "{} exited before the handshake (attempt {}): {}",
                        id,
                        attempts,
                        stderr.trim_end()
                    );
                }

                state.running.store(false, Ordering::Release);
                launched.process.kill();

                if let Some(max) = self.policy.max_attempts {
                    if attempts >= max {
                        return Err(Error::startup_failed(format!(
                            "gave up after {attempts} attempts; stderr: {}",
                            stderr.trim_end()
                        )));
                    }
                }

                tokio::time::sleep(self.policy.poll_interval(attempts)).await;
                if is_cancelled() {
                    continue;
                }

                let (relaunched, new_state) = self.launch(id, &descriptor)?;
                launched = relaunched;
                state = new_state;
                ready = launched.engine.send_command(DaemonCommand::EnableDevices)?;
                continue;
            }

            let wait = self.policy.poll_interval(attempts);
            match tokio::time::timeout(wait, &mut ready).await {
                Ok(Ok(_)) => {
                    state.started.store(true, Ordering::Release);
                    info!("{} ready: {}", id, descriptor);
                    return Ok(DeviceDaemon {
                        id,
                        descriptor,
                        process: launched.process,
                        engine: launched.engine,
                        state,
                    });
                }
                Ok(Err(Error::EngineDisposed)) => handshake_lost = true,
                Ok(Err(e)) => {
                    state.running.store(false, Ordering::Release);
                    launched.process.kill();
                    launched.engine.dispose();
                    return Err(Error::startup_failed(format!("handshake rejected: {e}")));
                }
                Err(_) => {}
            }
        }
    }
}
