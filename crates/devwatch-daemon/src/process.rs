//! Device daemon child process management

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::commands::lock;
use crate::descriptor::ToolDescriptor;
use crate::engine::ProtocolEngine;
use crate::launcher::{ExitListener, LaunchHooks, ProcessState, ToolProcess};
use crate::protocol::is_protocol_line;
use devwatch_core::events::DaemonEvent;
use devwatch_core::prelude::*;

/// How long the exit task waits for the output readers to hit EOF
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the output event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Manages one device daemon child process.
///
/// The `Child` handle is moved into a dedicated `wait_for_exit` task, which
/// publishes the real exit code on a watch channel. `DaemonProcess` keeps the
/// kill channel and a receiver for synchronous state checks.
///
/// Output is funneled through one event channel into a pump task, so the
/// engine sees stdout lines, stderr text and the exit in the order they were
/// read.
pub struct DaemonProcess {
    pid: Option<u32>,
    /// Consumed on first use (or on drop)
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    state: watch::Receiver<ProcessState>,
}

impl DaemonProcess {
    /// Spawn the tool described by `descriptor` and wire it to a new engine
    pub fn spawn(
        descriptor: &ToolDescriptor,
        hooks: LaunchHooks,
    ) -> Result<(Self, Arc<ProtocolEngine>)> {
        info!("Spawning device daemon: {}", descriptor);

        let mut child = Command::new(&descriptor.executable)
            .args(&descriptor.args)
            .current_dir(&descriptor.working_dir)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound {
                        path: descriptor.executable.clone(),
                    }
                } else {
                    Error::ProcessSpawn {
                        reason: e.to_string(),
                    }
                }
            })?;

        let pid = child.id();
        info!("Device daemon started with PID: {:?}", pid);

        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(Error::ProcessSpawn {
                    reason: "child stdio was not piped".to_string(),
                })
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let engine = Arc::new(ProtocolEngine::new(outbound_tx, hooks.on_message));
        tokio::spawn(Self::stdin_writer(stdin, outbound_rx));

        let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(EVENT_CHANNEL_CAPACITY);
        let readers = vec![
            tokio::spawn(Self::stdout_reader(stdout, event_tx.clone())),
            tokio::spawn(Self::stderr_reader(stderr, event_tx.clone())),
        ];

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(child, kill_rx, readers, event_tx, state_tx));
        tokio::spawn(Self::pump(event_rx, Arc::clone(&engine), hooks.on_exit));

        Ok((
            Self {
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
                state: state_rx,
            },
            engine,
        ))
    }

    /// Background task: owns `child`, waits for it to exit, then reports it.
    ///
    /// The task ends either when the process exits on its own or when
    /// `kill_rx` fires (or its sender is dropped).
    async fn wait_for_exit(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        readers: Vec<JoinHandle<()>>,
        event_tx: mpsc::Sender<DaemonEvent>,
        state_tx: watch::Sender<ProcessState>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        info!("Device daemon exited with status: {:?}", status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting for device daemon: {}", e);
                        None
                    }
                }
            }
            _ = kill_rx => {
                debug!("Kill requested, terminating device daemon");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill device daemon: {}", e);
                }
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("Error waiting after kill: {}", e);
                        None
                    }
                }
            }
        };

        // Visible to has_exited() before anyone sees the event
        state_tx.send_replace(ProcessState::Exited { code });

        // Let the readers deliver the last output so the stderr tail is complete
        for reader in readers {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Output reader still open after exit");
            }
        }

        let _ = event_tx.send(DaemonEvent::Exited { code }).await;
    }

    /// Feed output into the engine in read order
    async fn pump(
        mut events: mpsc::Receiver<DaemonEvent>,
        engine: Arc<ProtocolEngine>,
        on_exit: ExitListener,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                DaemonEvent::Stdout(line) if is_protocol_line(&line) => engine.handle_line(&line),
                DaemonEvent::Stdout(line) => debug!("[daemon] {}", line),
                DaemonEvent::Stderr(line) => {
                    engine.append_stderr(&line);
                    engine.append_stderr("\n");
                }
                DaemonEvent::Exited { code } => {
                    engine.dispose();
                    on_exit(code);
                    return;
                }
            }
        }
        // All senders gone without an exit event; the wait task was aborted
        engine.dispose();
    }

    /// Read lines from stdout and send as `DaemonEvent::Stdout`.
    async fn stdout_reader(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<DaemonEvent>) {
        let mut reader = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send(DaemonEvent::Stdout(line)).await.is_err() {
                debug!("stdout channel closed");
                break;
            }
        }

        debug!("stdout reader finished");
    }

    /// Read lines from stderr and send as `DaemonEvent::Stderr`.
    async fn stderr_reader(stderr: tokio::process::ChildStderr, tx: mpsc::Sender<DaemonEvent>) {
        let mut reader = BufReader::new(stderr).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            trace!("stderr: {}", line);

            if tx.send(DaemonEvent::Stderr(line)).await.is_err() {
                debug!("stderr channel closed");
                break;
            }
        }

        debug!("stderr reader finished");
    }

    /// Write framed commands to stdin
    async fn stdin_writer(
        mut stdin: tokio::process::ChildStdin,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(command) = rx.recv().await {
            if let Err(e) = stdin.write_all(command.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        debug!("stdin writer finished");
    }

    /// Exit code once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        match *self.state.borrow() {
            ProcessState::Exited { code } => code,
            ProcessState::Running => None,
        }
    }
}

impl ToolProcess for DaemonProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    fn kill(&self) {
        if self.has_exited() {
            return;
        }
        if let Some(tx) = lock(&self.kill_tx).take() {
            debug!("Killing device daemon (PID {:?})", self.pid);
            // The wait task may already be gone
            let _ = tx.send(());
        }
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            debug!("DaemonProcess dropped while running, killing it");
            if let Some(tx) = lock(&self.kill_tx).take() {
                let _ = tx.send(());
            }
        }
    }
}
