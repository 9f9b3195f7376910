//! Device registry
//!
//! Keeps one device daemon running for the current configuration and projects
//! its `device.added`/`device.removed` events into a [`DeviceListSnapshot`].
//! The daemon itself lives in a [`Refreshable`], so configuration changes,
//! restarts and shutdown all go through a single-flight recomputation.
//!
//! Every notification is delivered on the [`DeliveryContext`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use devwatch_core::prelude::*;
use devwatch_core::DaemonMessage;
use devwatch_daemon::{
    DeviceDaemon, DeviceListSnapshot, InstanceId, ProcessSupervisor, StartupPolicy,
    SupervisorHooks, ToolDescriptor, ToolLauncher,
};

use crate::delivery::{invoke_guarded, DeliveryContext};
use crate::refreshable::{lock, RefreshState, Refreshable, Request};

/// Tuning for the registry and the daemons it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub startup: StartupPolicy,
    /// Pause before starting a daemon, so a burst of refreshes starts only one
    pub settle_delay: Duration,
    /// Minimum time between automatic restarts after an unexpected exit
    pub restart_cooldown: Duration,
    /// Delay between a manual restart's shutdown and the new start
    pub restart_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            startup: StartupPolicy::default(),
            settle_delay: Duration::from_millis(100),
            restart_cooldown: Duration::from_secs(20),
            restart_delay: Duration::from_secs(4),
        }
    }
}

/// Decides what daemon should be running right now
#[cfg_attr(test, mockall::automock)]
pub trait DescriptorSource: Send + Sync {
    /// `None` when device watching is unconfigured
    fn descriptor(&self) -> Option<ToolDescriptor>;
}

/// Supervision state shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    /// Nothing running and nothing being started
    Inactive,
    /// Starting a daemon with none running
    Loading,
    /// A daemon is running while a recomputation is in flight
    Busy,
    Ready,
}

impl DaemonStatus {
    pub fn derive(state: RefreshState, running: bool) -> Self {
        match (state, running) {
            (RefreshState::Closed, _) => DaemonStatus::Inactive,
            (RefreshState::Busy, true) => DaemonStatus::Busy,
            (RefreshState::Busy, false) => DaemonStatus::Loading,
            (RefreshState::Idle, true) => DaemonStatus::Ready,
            (RefreshState::Idle, false) => DaemonStatus::Inactive,
        }
    }
}

/// Something observers should know about
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    DevicesChanged(DeviceListSnapshot),
    StatusChanged(DaemonStatus),
    Warning { message: String },
}

pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner {
    source: Arc<dyn DescriptorSource>,
    supervisor: ProcessSupervisor,
    config: RegistryConfig,
    delivery: DeliveryContext,
    daemon: Refreshable<Arc<DeviceDaemon>>,
    snapshot: watch::Sender<DeviceListSnapshot>,
    status: Mutex<DaemonStatus>,
    /// Instance whose events feed the snapshot
    current: Mutex<Option<InstanceId>>,
    last_auto_restart: Mutex<Option<Instant>>,
    listeners: Mutex<Vec<(SubscriptionId, RegistryListener)>>,
    next_listener: AtomicU64,
}

/// Devices reported by the current daemon, and the daemon's lifecycle
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl DeviceRegistry {
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        launcher: Arc<dyn ToolLauncher>,
        config: RegistryConfig,
        delivery: DeliveryContext,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let hooks = SupervisorHooks {
                on_message: {
                    let weak = weak.clone();
                    Arc::new(move |id: InstanceId, message: DaemonMessage| {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_daemon_message(id, message);
                        }
                    })
                },
                on_exit: {
                    let weak = weak.clone();
                    Arc::new(move |id: InstanceId, code: Option<i32>| {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_daemon_exit(id, code);
                        }
                    })
                },
                on_warning: {
                    let weak = weak.clone();
                    Arc::new(move |message: String| {
                        if let Some(inner) = weak.upgrade() {
                            inner.fire(RegistryEvent::Warning { message });
                        }
                    })
                },
            };

            let daemon = Refreshable::with_unpublish(delivery.clone(), |daemon: Arc<DeviceDaemon>| {
                daemon.shutdown()
            });
            let listener = weak.clone();
            if let Err(e) = daemon.subscribe(move || {
                if let Some(inner) = listener.upgrade() {
                    inner.on_daemon_changed();
                }
            }) {
                warn!("Failed to observe the device daemon: {}", e);
            }

            let (snapshot, _) = watch::channel(DeviceListSnapshot::empty());
            Inner {
                source,
                supervisor: ProcessSupervisor::new(launcher, config.startup.clone(), hooks),
                config,
                delivery,
                daemon,
                snapshot,
                status: Mutex::new(DaemonStatus::Inactive),
                current: Mutex::new(None),
                last_auto_restart: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Re-read the configuration and start, keep or stop the daemon to match
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// Stop the daemon now and start a fresh one after the restart delay
    pub fn restart(&self) {
        info!("Restarting the device daemon");
        if let Some(daemon) = self.inner.daemon.get_now() {
            daemon.shutdown();
        }
        let status = Arc::clone(&self.inner);
        self.inner.delivery.invoke_later(move || status.update_status());

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.refresh();
            }
        });
    }

    pub fn status(&self) -> DaemonStatus {
        *lock(&self.inner.status)
    }

    /// Current devices and selection
    pub fn snapshot(&self) -> DeviceListSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Observe snapshot changes without registering a listener
    pub fn watch_snapshot(&self) -> watch::Receiver<DeviceListSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn current_daemon(&self) -> Option<Arc<DeviceDaemon>> {
        self.inner.daemon.get_now()
    }

    /// Wait until the first daemon decision has been published
    pub async fn get_when_ready(&self) -> Option<Arc<DeviceDaemon>> {
        self.inner.daemon.get_when_ready().await
    }

    /// True while a daemon is being started, kept or stopped
    pub fn is_busy(&self) -> bool {
        self.inner.daemon.is_busy()
    }

    /// Select the device with `id`. Returns false if no such device exists.
    pub fn select_device(&self, id: &str) -> bool {
        if self.inner.snapshot.borrow().find(id).is_none() {
            return false;
        }
        self.inner.update_snapshot(|snapshot| Some(snapshot.with_selection(id)));
        true
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.inner.listeners).retain(|(existing, _)| *existing != id);
    }

    /// Ask the daemon to exit, then close the registry
    pub async fn shutdown_gracefully(&self, grace: Duration) {
        if let Some(daemon) = self.inner.daemon.get_now() {
            daemon.shutdown_gracefully(grace).await;
        }
        self.close();
    }

    /// Stop the daemon and stop refreshing. Idempotent.
    pub fn close(&self) {
        self.inner.daemon.close();
    }
}

impl Inner {
    fn refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.daemon.refresh(move |request| async move {
            match weak.upgrade() {
                Some(inner) => inner.choose_next_daemon(request).await,
                None => Err(Error::Cancelled),
            }
        });
    }

    /// Keep the running daemon if it still matches, otherwise start one
    async fn choose_next_daemon(
        &self,
        request: Request<Arc<DeviceDaemon>>,
    ) -> Result<Option<Arc<DeviceDaemon>>> {
        let Some(next) = self.source.descriptor() else {
            debug!("Device daemon not configured");
            return Ok(None);
        };

        if let Some(previous) = request.previous() {
            if !previous.needs_restart(&next) {
                trace!("Keeping {}", previous.id());
                return Ok(Some(Arc::clone(previous)));
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;
        if request.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let token = request.token();
        match self.supervisor.start(next, || token.is_cancelled()).await {
            Ok(daemon) => Ok(Some(Arc::new(daemon))),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                self.fire(RegistryEvent::Warning {
                    message: format!("Unable to start the device daemon: {e}"),
                });
                Err(e)
            }
        }
    }

    fn on_daemon_message(self: &Arc<Self>, id: InstanceId, message: DaemonMessage) {
        let inner = Arc::clone(self);
        self.delivery
            .invoke_later(move || inner.apply_message(id, &message));
    }

    fn on_daemon_exit(self: &Arc<Self>, id: InstanceId, code: Option<i32>) {
        let inner = Arc::clone(self);
        self.delivery
            .invoke_later(move || inner.daemon_stopped(id, code));
    }

    /// Runs on the delivery context
    fn apply_message(&self, id: InstanceId, message: &DaemonMessage) {
        if let DaemonMessage::LogMessage(log) = message {
            debug!("{} [{}] {}", id, log.level, log.message);
            return;
        }
        if *lock(&self.current) != Some(id) {
            trace!("Ignoring {} from {}", message.event_name(), id);
            return;
        }
        self.update_snapshot(|snapshot| snapshot.apply(message));
    }

    /// Runs on the delivery context
    fn daemon_stopped(self: &Arc<Self>, id: InstanceId, code: Option<i32>) {
        self.update_status();

        let Some(current) = self.daemon.get_now().filter(|d| d.id() == id) else {
            debug!("Superseded {} exited with {:?}", id, code);
            return;
        };

        let now = Instant::now();
        let may_restart = {
            let mut last = lock(&self.last_auto_restart);
            match *last {
                Some(at) if now.duration_since(at) < self.config.restart_cooldown => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };

        if may_restart {
            info!("{} exited with {:?}; restarting it", id, code);
            self.refresh();
        } else {
            let message = Error::process_exited(code, current.stderr_tail()).to_string();
            warn!("{}", message);
            self.fire(RegistryEvent::Warning { message });
        }
    }

    /// Runs on the delivery context after every cache transition and publish
    fn on_daemon_changed(&self) {
        let daemon = self.daemon.get_now();
        let id = daemon.as_ref().map(|d| d.id());
        let switched = {
            let mut current = lock(&self.current);
            if *current == id {
                false
            } else {
                *current = id;
                true
            }
        };

        if switched {
            let devices = daemon.map(|d| d.devices()).unwrap_or_default();
            self.update_snapshot(|snapshot| Some(snapshot.with_devices(devices)));
        }
        self.update_status();
    }

    fn update_status(&self) {
        let running = self
            .daemon
            .get_now()
            .map(|d| d.is_running())
            .unwrap_or(false);
        let next = DaemonStatus::derive(self.daemon.state(), running);
        let changed = {
            let mut status = lock(&self.status);
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        };
        if changed {
            debug!("Device daemon status: {:?}", next);
            self.fire(RegistryEvent::StatusChanged(next));
        }
    }

    fn update_snapshot<F>(&self, transition: F)
    where
        F: FnOnce(&DeviceListSnapshot) -> Option<DeviceListSnapshot>,
    {
        let mut updated = None;
        self.snapshot.send_if_modified(|snapshot| match transition(snapshot) {
            Some(next) if next != *snapshot => {
                *snapshot = next.clone();
                updated = Some(next);
                true
            }
            _ => false,
        });
        if let Some(snapshot) = updated {
            self.fire(RegistryEvent::DevicesChanged(snapshot));
        }
    }

    /// Deliver `event` to every listener on the delivery context
    fn fire(&self, event: RegistryEvent) {
        let listeners: Vec<RegistryListener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        self.delivery.invoke_later(move || {
            for listener in listeners {
                invoke_guarded("registry listener", || listener(&event));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devwatch_daemon::test_utils::{
        device_added_line, device_removed_line, test_device, FakeBehavior, FakeLauncher,
    };
    use devwatch_daemon::ToolProcess;

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            startup: StartupPolicy {
                short_poll: Duration::from_millis(1),
                long_poll: Duration::from_millis(2),
                slow_poll_after: 10,
                warn_after: 100,
                max_attempts: None,
            },
            settle_delay: Duration::from_millis(1),
            restart_cooldown: Duration::from_secs(20),
            restart_delay: Duration::from_millis(1),
        }
    }

    fn sdk_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("/opt/flutter", "/opt/flutter/bin/flutter").with_args(["daemon"])
    }

    type Events = Arc<Mutex<Vec<RegistryEvent>>>;

    struct Harness {
        registry: DeviceRegistry,
        launcher: Arc<FakeLauncher>,
        delivery: DeliveryContext,
        descriptor: Arc<Mutex<Option<ToolDescriptor>>>,
        events: Events,
    }

    impl Harness {
        fn new(script: Vec<FakeBehavior>, config: RegistryConfig) -> Self {
            let descriptor = Arc::new(Mutex::new(Some(sdk_descriptor())));
            let mut source = MockDescriptorSource::new();
            let current = Arc::clone(&descriptor);
            source
                .expect_descriptor()
                .returning(move || current.lock().unwrap().clone());

            let launcher = Arc::new(FakeLauncher::new(script));
            let delivery = DeliveryContext::spawn();
            let registry = DeviceRegistry::new(
                Arc::new(source),
                launcher.clone(),
                config,
                delivery.clone(),
            );

            let events: Events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            registry.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

            Self {
                registry,
                launcher,
                delivery,
                descriptor,
                events,
            }
        }

        async fn settle(&self) {
            self.delivery.flush().await;
            for _ in 0..5000 {
                if !self.registry.is_busy() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            // Publishing fires events, which queue one more round of jobs
            self.delivery.flush().await;
            self.delivery.flush().await;
        }

        fn set_descriptor(&self, next: Option<ToolDescriptor>) {
            *self.descriptor.lock().unwrap() = next;
        }

        fn statuses(&self) -> Vec<DaemonStatus> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    RegistryEvent::StatusChanged(s) => Some(*s),
                    _ => None,
                })
                .collect()
        }

        fn warnings(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    RegistryEvent::Warning { message } => Some(message.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(
            DaemonStatus::derive(RefreshState::Idle, true),
            DaemonStatus::Ready
        );
        assert_eq!(
            DaemonStatus::derive(RefreshState::Busy, true),
            DaemonStatus::Busy
        );
        assert_eq!(
            DaemonStatus::derive(RefreshState::Busy, false),
            DaemonStatus::Loading
        );
        assert_eq!(
            DaemonStatus::derive(RefreshState::Idle, false),
            DaemonStatus::Inactive
        );
        assert_eq!(
            DaemonStatus::derive(RefreshState::Closed, true),
            DaemonStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_refresh_starts_daemon() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        assert_eq!(h.registry.status(), DaemonStatus::Ready);
        assert_eq!(h.launcher.launch_count(), 1);
        assert_eq!(h.launcher.descriptors(), vec![sdk_descriptor()]);
        let statuses = h.statuses();
        assert_eq!(statuses.first(), Some(&DaemonStatus::Loading));
        assert_eq!(statuses.last(), Some(&DaemonStatus::Ready));
    }

    #[tokio::test]
    async fn test_device_events_update_snapshot() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        let bravo = test_device("b", "Bravo");
        let alpha = test_device("a", "Alpha");
        h.launcher.emit(0, &device_added_line(&bravo));
        h.launcher.emit(0, &device_added_line(&alpha));
        h.settle().await;

        let snapshot = h.registry.snapshot();
        let names: Vec<&str> = snapshot.devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Bravo"]);
        assert_eq!(snapshot.selected().map(|d| d.id.as_str()), Some("b"));

        h.launcher.emit(0, &device_removed_line(&bravo));
        h.settle().await;
        let snapshot = h.registry.snapshot();
        assert_eq!(snapshot.devices().len(), 1);
        assert!(snapshot.selected().is_none());

        let changes = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RegistryEvent::DevicesChanged(_)))
            .count();
        assert_eq!(changes, 3);
    }

    #[tokio::test]
    async fn test_select_device() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;
        h.launcher.emit(0, &device_added_line(&test_device("a", "Alpha")));
        h.launcher.emit(0, &device_added_line(&test_device("b", "Bravo")));
        h.settle().await;

        assert!(h.registry.select_device("b"));
        assert_eq!(
            h.registry.snapshot().selected().map(|d| d.id.clone()),
            Some("b".to_string())
        );
        assert!(!h.registry.select_device("missing"));
        assert_eq!(
            h.registry.snapshot().selected().map(|d| d.id.clone()),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn test_unchanged_descriptor_reuses_daemon() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;
        let first = h.registry.current_daemon().unwrap();

        h.registry.refresh();
        h.settle().await;
        assert_eq!(h.launcher.launch_count(), 1);
        assert_eq!(h.registry.current_daemon().unwrap().id(), first.id());
        assert!(first.is_running());
    }

    #[tokio::test]
    async fn test_descriptor_change_replaces_daemon() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;
        h.launcher.emit(0, &device_added_line(&test_device("a", "Alpha")));
        h.settle().await;

        let next = sdk_descriptor().with_args(["--show-test-device", "daemon"]);
        h.set_descriptor(Some(next.clone()));
        h.registry.refresh();
        h.settle().await;

        assert_eq!(h.launcher.launch_count(), 2);
        assert!(h.launcher.process(0).has_exited());
        let current = h.registry.current_daemon().unwrap();
        assert_eq!(current.descriptor(), &next);
        // The new daemon has not reported anything yet
        assert!(h.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_daemon_events_are_ignored() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        h.set_descriptor(Some(sdk_descriptor().with_args(["--show-test-device", "daemon"])));
        h.registry.refresh();
        h.settle().await;
        assert_eq!(h.launcher.launch_count(), 2);

        h.launcher.emit(0, &device_added_line(&test_device("old", "Old Phone")));
        h.settle().await;
        assert!(h.registry.snapshot().is_empty());

        h.launcher.emit(1, &device_added_line(&test_device("new", "New Phone")));
        h.settle().await;
        let snapshot = h.registry.snapshot();
        let ids: Vec<&str> = snapshot.devices().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test]
    async fn test_unconfigured_stops_daemon() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        h.set_descriptor(None);
        h.registry.refresh();
        h.settle().await;

        assert!(h.registry.current_daemon().is_none());
        assert!(h.launcher.process(0).has_exited());
        assert_eq!(h.registry.status(), DaemonStatus::Inactive);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_previous_daemon() {
        let script = vec![
            FakeBehavior::Ready,
            FakeBehavior::ExitImmediately {
                stderr: "broken sdk".into(),
            },
            FakeBehavior::ExitImmediately {
                stderr: "broken sdk".into(),
            },
        ];
        let mut config = fast_config();
        config.startup.max_attempts = Some(2);
        let h = Harness::new(script, config);
        h.registry.refresh();
        h.settle().await;
        let first = h.registry.current_daemon().unwrap();

        h.set_descriptor(Some(sdk_descriptor().with_env("FLUTTER_ROOT", "/other")));
        h.registry.refresh();
        h.settle().await;

        assert_eq!(h.launcher.launch_count(), 3);
        assert_eq!(h.registry.current_daemon().unwrap().id(), first.id());
        assert!(first.is_running());
        let warnings = h.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("broken sdk"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_restarts_then_warns_within_cooldown() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        h.launcher.process(0).exit(Some(1));
        h.settle().await;
        assert_eq!(h.launcher.launch_count(), 2);
        assert_eq!(h.registry.status(), DaemonStatus::Ready);
        assert!(h.warnings().is_empty());

        h.launcher.process(1).exit(Some(2));
        h.settle().await;
        assert_eq!(h.launcher.launch_count(), 2);
        assert_eq!(h.registry.status(), DaemonStatus::Inactive);
        let warnings = h.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("exit code Some(2)"));
    }

    #[tokio::test]
    async fn test_manual_restart() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        h.registry.restart();
        assert!(h.launcher.process(0).has_exited());
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.settle().await;

        assert_eq!(h.launcher.launch_count(), 2);
        assert_eq!(h.registry.status(), DaemonStatus::Ready);
        assert!(h.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_delivery() {
        let h = Harness::new(vec![], fast_config());
        h.registry.subscribe(|_| panic!("listener bug"));
        let late = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&late);
        h.registry
            .subscribe(move |_| *counter.lock().unwrap() += 1);

        h.registry.refresh();
        h.settle().await;
        assert!(*late.lock().unwrap() > 0);
        assert!(!h.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_registry() {
        let h = Harness::new(vec![], fast_config());
        h.registry.refresh();
        h.settle().await;

        h.registry
            .shutdown_gracefully(Duration::from_millis(100))
            .await;
        h.settle().await;

        assert_eq!(
            h.launcher.sent_methods(0),
            vec!["device.enable", "daemon.shutdown"]
        );
        assert!(h.registry.current_daemon().is_none());
        assert_eq!(h.registry.status(), DaemonStatus::Inactive);
        assert!(h.warnings().is_empty());

        h.registry.refresh();
        h.settle().await;
        assert_eq!(h.launcher.launch_count(), 1);
    }
}
