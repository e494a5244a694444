mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Logging setup for the binary and tests.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Base level; `RUST_LOG` replaces the whole filter when set.
    pub log_level: Level,
    /// Extra `target=level` pairs, e.g. `("switchyard_store", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// Emit stderr lines as JSON rather than the compact text format.
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: data_dir().join("logs.db"),
        }
    }
}

/// Returned by [`init_telemetry`]; hold it for the life of the process.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
    sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// Persisted warn+ records, when the log database could be opened.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.sink.as_deref()
    }
}

fn filter_directives(config: &TelemetryConfig) -> String {
    std::iter::once(config.log_level.as_str().to_lowercase())
        .chain(
            config
                .module_levels
                .iter()
                .map(|(target, level)| format!("{target}={}", level.as_str().to_lowercase())),
        )
        .collect::<Vec<_>>()
        .join(",")
}

/// A broken log database must not stop the server, so failure only prints.
fn open_sink(config: &TelemetryConfig) -> Option<Arc<SqliteLogSink>> {
    if !config.log_to_sqlite {
        return None;
    }
    SqliteLogSink::new(&config.log_db_path)
        .map(Arc::new)
        .map_err(|e| eprintln!("switchyard: log database {} unavailable: {e}", config.log_db_path.display()))
        .ok()
}

/// Install the global subscriber. Call once, before any other tracing.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));
    let stderr = if config.json {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .boxed()
    };

    let sink = open_sink(&config);
    tracing_subscriber::registry()
        .with(stderr.with_filter(filter))
        .with(sink.as_ref().map(|s| SqliteLogLayer::new(Arc::clone(s))))
        .init();

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
        sink,
    }
}

/// `$HOME/.switchyard`, falling back to the system temp dir.
pub fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".switchyard")
}
