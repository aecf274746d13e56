mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricKind, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "coach_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let dir = coach_dir().join("database");
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: dir.join("coach-logs.db"),
            metrics_enabled: true,
            metrics_db_path: dir.join("coach-metrics.db"),
        }
    }
}

impl TelemetryConfig {
    fn filter_directive(&self) -> String {
        let mut directive = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directive.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        directive
    }
}

/// Handles to the sinks installed by [`init_telemetry`].
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    /// Shared metrics recorder, if metrics are enabled.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics.clone()
    }

    /// Log sink for querying persisted warn+ logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.snapshot() {
                eprintln!("coach-telemetry: final metrics snapshot failed: {e}");
            }
        }
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("coach-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    let metrics = if config.metrics_enabled {
        match MetricsRecorder::open(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB, metrics stay in memory");
                Some(Arc::new(MetricsRecorder::in_memory()))
            }
        }
    } else {
        None
    };

    TelemetryGuard { log_sink, metrics }
}

fn coach_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".coach")
}
