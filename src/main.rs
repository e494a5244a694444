//! # switchyard
//!
//! Feature toggle admin server binary: wires the event log, projections and
//! HTTP API together.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::Level;

use switchyard_server::{AppState, ServerConfig};
use switchyard_store::{Database, RetryPolicy, Stores};
use switchyard_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "switchyard", about = "Feature toggle admin server")]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, env = "SWITCHYARD_DB")]
    db: Option<PathBuf>,

    #[arg(long, env = "SWITCHYARD_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Do not persist warn+ logs to the log database.
    #[arg(long)]
    no_log_db: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the admin API (default).
    Serve(ServeArgs),
    /// Replay the event log into every projection and exit.
    Rebuild,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value_t = 4242)]
    port: u16,

    /// Attempts per projection apply when the database is busy.
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,
}

impl Default for ServeArgs {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            bind: config.bind,
            port: config.port,
            retry_attempts: RetryPolicy::default().max_attempts,
        }
    }
}

impl Cli {
    fn db_path(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| switchyard_telemetry::data_dir().join("switchyard.db"))
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            log_to_sqlite: !self.no_log_db,
            ..TelemetryConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(cli.telemetry_config());

    let db_path = cli.db_path();
    let db = Database::open(&db_path).with_context(|| format!("failed to open database {}", db_path.display()))?;

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Rebuild => {
            let stores = Stores::open(db, RetryPolicy::default(), Some(telemetry.metrics()));
            for report in stores.rebuild_all().await.context("rebuild failed")? {
                tracing::info!(
                    projection = %report.projection,
                    replayed = report.replayed,
                    failed = report.failed,
                    rows = report.rows,
                    "rebuild complete"
                );
            }
        }
        Command::Serve(args) => {
            let retry = RetryPolicy::default().with_max_attempts(args.retry_attempts);
            let stores = Stores::open(db, retry, Some(telemetry.metrics()));
            let state = AppState::new(stores).with_metrics(telemetry.metrics());
            let config = ServerConfig {
                bind: args.bind,
                port: args.port,
            };
            let handle = switchyard_server::start(config, state)
                .await
                .context("failed to start server")?;
            tracing::info!(port = handle.port, "switchyard ready");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl+c")?;
            tracing::info!("shutting down");
            handle.shutdown();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["switchyard"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, Level::INFO);
        assert!(!cli.no_log_db);
        let args = ServeArgs::default();
        assert_eq!(args.port, 4242);
        assert_eq!(args.retry_attempts, 3);
    }

    #[test]
    fn cli_serve_flags() {
        let cli = Cli::parse_from(["switchyard", "--log-level", "debug", "serve", "--port", "8080", "--retry-attempts", "5"]);
        assert_eq!(cli.log_level, Level::DEBUG);
        match cli.command {
            Some(Command::Serve(args)) => {
                assert_eq!(args.port, 8080);
                assert_eq!(args.bind, "0.0.0.0");
                assert_eq!(args.retry_attempts, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_rebuild_with_db() {
        let cli = Cli::parse_from(["switchyard", "--db", "/tmp/s.db", "--no-log-db", "rebuild"]);
        assert!(matches!(cli.command, Some(Command::Rebuild)));
        assert_eq!(cli.db_path(), PathBuf::from("/tmp/s.db"));
        assert!(!cli.telemetry_config().log_to_sqlite);
    }

    /// Dispatch isolates handler panics, which needs unwinding.
    #[test]
    fn release_profile_unwinds() {
        let manifest = include_str!("../Cargo.toml");
        let release = manifest.split("[profile.release]").nth(1).unwrap_or_default();
        assert!(!release.contains("panic = \"abort\""));
    }
}
