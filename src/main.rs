//! `strata` command-line entry point.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use strata_core::settings::{load_settings, load_settings_from_path};
use strata_engine::ContextService;
use strata_server::ServerConfig;
use strata_store::Database;
use strata_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "strata", about = "Hierarchical context resolution service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the JSON-RPC WebSocket API.
    Serve {
        /// Database file. Overrides `store.dbPath`.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Listen port. Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Settings file. Defaults to `~/.strata/settings.json`.
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Args::parse().command {
        Command::Serve { db, port, settings } => serve(db, port, settings).await,
    }
}

async fn serve(db: Option<PathBuf>, port: Option<u16>, settings_path: Option<PathBuf>) -> Result<()> {
    let mut settings = match &settings_path {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(db) = db {
        settings.store.db_path = db.to_string_lossy().into_owned();
    }
    if let Some(port) = port {
        settings.server.port = port;
    }

    let telemetry = Arc::new(init_telemetry(TelemetryConfig::from_settings(&settings.logging)));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting strata");

    let db_path = expand_home(&settings.store.db_path);
    let db = Database::open(&db_path).with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let service = Arc::new(ContextService::init(&settings, db));
    let handle = strata_server::start_with_telemetry(
        ServerConfig::from_settings(&settings.server),
        Arc::clone(&service),
        Some(telemetry),
    )
    .await
    .context("failed to start server")?;
    tracing::info!(port = handle.port, "strata ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    service.shutdown();
    Ok(())
}

/// Expand a leading `~` to `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_home_prefix() {
        let expanded = expand_home("~/.strata/db.sqlite");
        assert!(expanded.ends_with(".strata/db.sqlite"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_home("/var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
    }

    #[test]
    fn parses_serve_flags() {
        let args = Args::try_parse_from(["strata", "serve", "--db", "/tmp/x.db", "--port", "8080"]).unwrap();
        let Command::Serve { db, port, settings } = args.command;
        assert_eq!(db, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(port, Some(8080));
        assert!(settings.is_none());
    }
}
