// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! streamctl - control plane for video-analytics instances.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port 8765
//! streamctl
//!
//! # Using configuration file, with a port override
//! streamctl --config streamctl.toml --port 9000
//!
//! # Write an example configuration
//! streamctl gen-config -o streamctl.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamctl::{ControlConfig, ControlServer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// streamctl control plane
#[derive(Parser, Debug)]
#[command(name = "streamctl")]
#[command(about = "Control plane for video-analytics worker instances")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Listen port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "streamctl.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    info!("streamctl v{}", env!("CARGO_PKG_VERSION"));
    let server = ControlServer::new(config)?;
    let listener = server.bind().await?;

    // Ctrl+C: drain the instances, then stop serving
    let signal_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutting down...");
        match signal_server.drain().await {
            Ok(report) => info!(
                "Drained: {} acknowledged, {} failed, {} forced",
                report.acknowledged, report.failed, report.forced
            ),
            Err(e) => warn!("Drain skipped: {}", e),
        }
        signal_server.stop();
    });

    server.serve(listener).await?;
    Ok(())
}

fn build_config(args: &Args) -> Result<ControlConfig, Box<dyn std::error::Error>> {
    let mut config = match args.config {
        Some(ref path) => ControlConfig::from_file(path)?,
        None => ControlConfig::default(),
    };

    if let Some(ref bind) = args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&ControlConfig::default())?;

    let content = format!(
        r#"# streamctl configuration
# Generated by streamctl gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match ControlConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Listen:            {}", config.listen_addr());
            println!("History capacity:  {}", config.history_capacity);
            println!("Camera retention:  {}s", config.camera_retention_secs);
            println!(
                "Drain deadline:    {}ms (ack {}ms)",
                config.shutdown.drain_deadline_ms, config.shutdown.ack_timeout_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
