// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Data Motion Manager Service
//!
//! Runs the storage orchestration layer of a management server:
//!
//! - Connects to PostgreSQL and creates the schema if needed
//! - Builds the data motion strategy, cache manager and pool automation
//! - Polls host agents for the status of volume uploads

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use datamotion_manager::config::ManagerConfig;
use datamotion_manager::context::ManagerContext;
use datamotion_manager::db::postgres::Database;
use datamotion_manager::metrics;
use datamotion_manager::workload::HttpWorkloadManager;

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn print_help(program: &str) {
    print_version();
    println!("Usage: {} [OPTIONS]", program);
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!();
    println!("Environment variables:");
    println!("  DATABASE_URL                   PostgreSQL connection URL (required)");
    println!("  MANAGEMENT_SERVER_ID           Id of this management server (default: 1)");
    println!("  AGENT_PORT                     Host agent port (default: 8250)");
    println!("  AGENT_TIMEOUT_SECS             Agent request timeout (default: 30)");
    println!("  WORKLOAD_URL                   VM service URL (default: http://localhost:8080)");
    println!("  UPLOAD_MONITOR_INTERVAL_SECS   Upload poll interval (default: 60)");
    println!("  UPLOAD_OPERATION_TIMEOUT_SECS  Upload timeout (default: 600)");
    println!("  COPY_VOLUME_WAIT, BACKUP_SNAPSHOT_WAIT, ...");
    println!("                                 Remote command waits in seconds");
    println!(
        "  CONFIG_FILE                    Path to JSON config file for SIGUSR1 reloading (optional)"
    );
    println!(
        "  RUST_LOG                       Log filter (default: datamotion_manager=info)"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_help(&args[0]);
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "datamotion_manager=info".to_string()),
        ))
        .init();

    print_version();

    // reqwest is built without a default provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ManagerConfig::from_env().context("Failed to load configuration")?;
    info!("Database URL: {}", config.database_url_display());
    info!(
        management_server_id = config.management_server_id,
        agent_port = config.agent_port,
        "Management server identity"
    );

    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    db.init_schema()
        .await
        .context("Failed to initialize database schema")?;

    let (settings_tx, settings_rx) = watch::channel(config.motion.clone());

    #[cfg(unix)]
    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        use std::path::PathBuf;

        let config_path = PathBuf::from(&config_file);
        if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            tokio::spawn(ManagerConfig::start_config_watcher(
                config_path,
                config.clone(),
                settings_tx,
            ));
            info!(
                config_file = %config_file,
                "Config watcher started - send SIGUSR1 to reload"
            );
        } else {
            tracing::warn!(
                config_file = %config_file,
                "CONFIG_FILE specified but file does not exist, config reloading disabled"
            );
        }
    }

    let workloads = Arc::new(
        HttpWorkloadManager::new(config.workload_url.clone(), config.agent_timeout_secs)
            .context("Failed to create VM service client")?,
    );

    let context = ManagerContext::new(config, Arc::new(db), workloads, settings_rx)
        .context("Failed to create manager context")?;

    let monitor = context.start();
    info!("Data motion manager running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    context.shutdown();
    if let Some(handle) = monitor {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Upload monitor task ended abnormally");
        }
    }
    tracing::debug!(metrics = %metrics::gather_metrics(), "Final metrics");

    info!("Data motion manager stopped");
    Ok(())
}
