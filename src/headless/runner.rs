//! Headless runner - supervises the device daemon and streams events
//!
//! Reads simple line commands from stdin (`select <id>`, `refresh`,
//! `restart`, `quit`) and writes [`HeadlessEvent`]s to stdout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use devwatch_app::{
    ConfigDescriptorSource, ConfigEvent, ConfigWatcher, DeliveryContext, DeviceRegistry,
    ProcessLauncher,
};
use devwatch_core::prelude::*;

use super::HeadlessEvent;

/// How long the daemon gets to exit after `daemon.shutdown`
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A line typed on stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinCommand {
    Select(String),
    Refresh,
    Restart,
    Quit,
}

impl StdinCommand {
    /// Parse one line; `None` for blank lines
    pub fn parse(line: &str) -> Option<std::result::Result<Self, String>> {
        let mut words = line.split_whitespace();
        let command = words.next()?;
        let parsed = match (command, words.next()) {
            ("select", Some(id)) => Ok(Self::Select(id.to_string())),
            ("select", None) => Err("usage: select <device-id>".to_string()),
            ("refresh", None) => Ok(Self::Refresh),
            ("restart", None) => Ok(Self::Restart),
            ("quit" | "exit", None) => Ok(Self::Quit),
            _ => Err(format!("unknown command: {}", line.trim())),
        };
        Some(parsed)
    }
}

/// Run until interrupted or told to quit
pub async fn run_headless(project_path: &Path) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("devwatch starting in HEADLESS mode");
    info!("Project: {}", project_path.display());
    info!("═══════════════════════════════════════════════════════");

    let delivery = DeliveryContext::spawn();
    let source = Arc::new(ConfigDescriptorSource::load(project_path));
    let registry = DeviceRegistry::new(
        source.clone(),
        Arc::new(ProcessLauncher),
        source.settings().registry_config(),
        delivery.clone(),
    );
    registry.subscribe(|event| HeadlessEvent::from(event).emit());
    registry.refresh();

    let (config_tx, mut config_rx) = mpsc::channel(16);
    let mut watcher = ConfigWatcher::new(project_path.to_path_buf());
    if let Err(e) = watcher.start(config_tx) {
        warn!("Settings watcher not started: {}", e);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            Some(event) = config_rx.recv() => match event {
                ConfigEvent::Changed => {
                    if source.reload() {
                        HeadlessEvent::config_reloaded().emit();
                    }
                    registry.refresh();
                }
                ConfigEvent::Error { message } => HeadlessEvent::warning(message).emit(),
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match StdinCommand::parse(&line) {
                    Some(Ok(StdinCommand::Select(id))) => {
                        if !registry.select_device(&id) {
                            HeadlessEvent::error(format!("no such device: {id}"), false).emit();
                        }
                    }
                    Some(Ok(StdinCommand::Refresh)) => registry.refresh(),
                    Some(Ok(StdinCommand::Restart)) => registry.restart(),
                    Some(Ok(StdinCommand::Quit)) => break,
                    Some(Err(message)) => HeadlessEvent::error(message, false).emit(),
                    None => {}
                },
                Ok(None) => {
                    info!("stdin closed; running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    watcher.stop();
    registry.shutdown_gracefully(SHUTDOWN_GRACE).await;
    delivery.flush().await;

    info!("devwatch headless mode exiting");
    Ok(())
}
