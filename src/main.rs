//! devwatch - Streams the devices a Flutter daemon reports
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;
use devwatch_app::config::init_config_dir;

/// devwatch - Streams the devices a Flutter daemon reports
#[derive(Parser, Debug)]
#[command(name = "devwatch")]
#[command(about = "Supervises a device discovery daemon and prints its devices as NDJSON", long_about = None)]
struct Args {
    /// Path to the project
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Write a default .devwatch/config.toml and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    // Get project path from args or use current directory
    let project_path = args
        .path
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if args.init {
        let config_path = init_config_dir(&project_path)?;
        eprintln!("Settings file: {}", config_path.display());
        return Ok(());
    }

    devwatch_core::logging::init()?;
    device_watch::run_headless(&project_path).await?;
    Ok(())
}
