//! # coach
//!
//! Operator CLI over the coach database: inspect traces and credit
//! accounts, read or clear a conversation, seed credits, and read back
//! persisted logs and metrics.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use coach_core::ids::{CoachId, TraceId, UserId};
use coach_core::settings::{load_settings, CoachSettings};
use coach_engine::{
    ConversationMemoryManager, CreditError, CreditMeter, PollOutcome, TraceInspector,
};
use coach_store::{ConversationRepo, CreditRepo, Database, ShadowRepo, TraceRepo};
use coach_telemetry::{init_telemetry, LogQuery, MetricsQuery, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "coach", about = "Coach reliability core operator tool")]
struct Cli {
    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the aggregated bundle for a trace.
    Trace {
        trace_id: String,
        /// Poll until the trace stops running.
        #[arg(long)]
        watch: bool,
    },
    /// List a user's most recent trace ids.
    Traces {
        user_id: String,
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Show a user's credit account.
    Credits { user_id: String },
    /// Create a credit account if missing.
    SeedCredits {
        user_id: String,
        /// Monthly quota (defaults to the configured quota).
        #[arg(long)]
        quota: Option<u32>,
    },
    /// Print the prompt context for a conversation.
    Context { user_id: String, coach_id: String },
    /// Delete a conversation.
    Clear { user_id: String, coach_id: String },
    /// Query persisted warn+ log lines, newest first.
    Logs {
        #[arg(long)]
        trace_id: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        /// WARN or ERROR.
        #[arg(long)]
        level: Option<String>,
        /// RFC 3339 lower bound on the timestamp.
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Query persisted metric snapshots.
    Metrics {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Drop expired shadow suggestions and old metrics.
    Prune {
        #[arg(long, default_value = "30")]
        metrics_retention_days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings().context("invalid coach settings")?;
    if let Some(path) = cli.db_path.clone() {
        settings.storage.database_path = path;
    }

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::WARN,
        json: !cli.pretty,
        ..TelemetryConfig::default()
    });

    ensure_parent_dir(&settings.storage.database_path)?;
    let db = Database::open(&settings.storage.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            settings.storage.database_path.display()
        )
    })?;
    tracing::debug!(path = %db.path().display(), "database opened");

    match cli.command {
        Command::Trace { trace_id, watch } => trace(&db, &settings, trace_id, watch).await?,
        Command::Traces { user_id, limit } => {
            let ids = TraceRepo::new(db).recent_trace_ids(&UserId::from_raw(user_id), limit)?;
            print_json(&ids)?;
        }
        Command::Credits { user_id } => {
            let meter = CreditMeter::new(Arc::new(CreditRepo::new(db)), UserId::from_raw(user_id));
            match meter.status().await {
                Ok(status) => print_json(&status)?,
                Err(CreditError::NoAccount(user)) => anyhow::bail!("no credit account for {user}"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::SeedCredits { user_id, quota } => {
            let quota = quota.unwrap_or(settings.credits.default_monthly_quota);
            let status = CreditRepo::new(db).ensure_account(&UserId::from_raw(user_id), quota)?;
            print_json(&status)?;
        }
        Command::Context { user_id, coach_id } => {
            let memory = memory(db, &settings);
            let text = memory
                .get_prompt_context(&UserId::from_raw(user_id), &CoachId::from_raw(coach_id))
                .await;
            println!("{text}");
        }
        Command::Clear { user_id, coach_id } => {
            let memory = memory(db, &settings);
            memory
                .clear(&UserId::from_raw(user_id), &CoachId::from_raw(coach_id))
                .await?;
        }
        Command::Logs {
            trace_id,
            user_id,
            level,
            since,
            limit,
        } => {
            let Some(sink) = telemetry.logs() else {
                anyhow::bail!("log persistence is disabled");
            };
            let query = log_query(trace_id, user_id, level, since, limit);
            print_json(&sink.query(&query)?)?;
        }
        Command::Metrics { name, since, limit } => {
            let Some(recorder) = telemetry.metrics() else {
                anyhow::bail!("metrics persistence is disabled");
            };
            let query = MetricsQuery {
                name,
                since,
                limit: Some(limit),
            };
            print_json(&recorder.query(&query)?)?;
        }
        Command::Prune {
            metrics_retention_days,
        } => {
            let suggestions = ShadowRepo::new(db).prune_expired(Utc::now())?;
            let metrics = match telemetry.metrics() {
                Some(m) => m.prune(metrics_retention_days)?,
                None => 0,
            };
            print_json(&serde_json::json!({
                "shadowSuggestions": suggestions,
                "metricRows": metrics,
            }))?;
        }
    }
    Ok(())
}

async fn trace(db: &Database, settings: &CoachSettings, trace_id: String, watch: bool) -> Result<()> {
    let inspector = TraceInspector::new(Arc::new(TraceRepo::new(db.clone())), &settings.traces);
    let trace_id = TraceId::from_raw(trace_id);

    let bundle = if watch {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });
        match inspector.watch(&trace_id, &cancel).await {
            PollOutcome::Terminal(b) => b,
            PollOutcome::Exhausted(b) => {
                tracing::warn!(trace_id = %trace_id, "trace still running after max poll attempts");
                b.flatten()
            }
            PollOutcome::Cancelled(b) => b.flatten(),
        }
    } else {
        inspector.load(&trace_id).await
    };

    match bundle {
        Some(bundle) => print_json(&bundle),
        None => anyhow::bail!("no events for trace {trace_id}"),
    }
}

/// Levels are stored upper-case.
fn log_query(
    trace_id: Option<String>,
    user_id: Option<String>,
    level: Option<String>,
    since: Option<String>,
    limit: u32,
) -> LogQuery {
    LogQuery {
        level: level.map(|l| l.to_uppercase()),
        trace_id,
        user_id,
        since,
        limit: Some(limit),
    }
}

fn memory(db: Database, settings: &CoachSettings) -> ConversationMemoryManager {
    ConversationMemoryManager::new(Arc::new(ConversationRepo::new(db)), settings.memory.clone())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
