use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ log line persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs, keyed by the trace and user they belong to.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 trace_id TEXT,
                 user_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_trace ON logs(trace_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, line: &LogLine) {
        let conn = self.conn.lock();
        // A failed log write must never take the caller down.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, trace_id, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                line.timestamp,
                line.level,
                line.target,
                line.message,
                line.fields,
                line.trace_id,
                line.user_id,
            ],
        );
    }

    /// Most recent matching records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, trace_id, user_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        let filters = [
            ("level", &q.level),
            ("trace_id", &q.trace_id),
            ("user_id", &q.user_id),
        ];
        for (column, value) in filters {
            if let Some(v) = value {
                params.push(v.clone());
                sql.push_str(&format!(" AND {column} = ?{}", params.len()));
            }
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                trace_id: row.get(6)?,
                user_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogLine {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    trace_id: Option<String>,
    user_id: Option<String>,
}

/// `tracing` layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation ids found on a span, inherited by events inside it.
#[derive(Clone, Default)]
struct Correlation {
    trace_id: Option<String>,
    user_id: Option<String>,
}

impl Correlation {
    fn fill_from(&mut self, other: &Correlation) {
        if self.trace_id.is_none() {
            self.trace_id.clone_from(&other.trace_id);
        }
        if self.user_id.is_none() {
            self.user_id.clone_from(&other.user_id);
        }
    }

    fn is_complete(&self) -> bool {
        self.trace_id.is_some() && self.user_id.is_some()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    ids: Correlation,
}

impl FieldVisitor {
    fn record_text(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "trace_id" => self.ids.trace_id = Some(value),
            "user_id" => self.ids.user_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        self.record_text(field.name(), text.trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if !visitor.ids.is_complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(ids) = span.extensions().get::<Correlation>() {
                        visitor.ids.fill_from(ids);
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            trace_id: visitor.ids.trace_id,
            user_id: visitor.ids.user_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.trace_id.is_none() && visitor.ids.user_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn line(level: &str, message: &str, trace_id: Option<&str>) -> LogLine {
        LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: "coach_llm::resilience".into(),
            message: message.into(),
            fields: None,
            trace_id: trace_id.map(str::to_string),
            user_id: None,
        }
    }

    #[test]
    fn insert_and_count() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&line("WARN", "circuit opened", None));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_trace_and_level() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&line("WARN", "slow llm stage", Some("trace_a")));
        sink.insert(&line("ERROR", "store unavailable", Some("trace_a")));
        sink.insert(&line("ERROR", "other trace", Some("trace_b")));

        let by_trace = sink
            .query(&LogQuery {
                trace_id: Some("trace_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_trace.len(), 2);
        assert_eq!(by_trace[0].message, "store unavailable");

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                trace_id: Some("trace_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn query_limit_returns_most_recent() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..5 {
            sink.insert(&line("WARN", &format!("msg {i}"), None));
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "msg 4");
    }

    #[test]
    fn layer_persists_warn_with_span_correlation() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("turn", trace_id = "trace_xyz", user_id = "user_1");
            let _entered = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(stage = "llm", "guard rejected call");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, "WARN");
        assert_eq!(record.message, "guard rejected call");
        assert_eq!(record.trace_id.as_deref(), Some("trace_xyz"));
        assert_eq!(record.user_id.as_deref(), Some("user_1"));
        assert!(record.fields.as_deref().unwrap_or_default().contains("llm"));
    }

    #[test]
    fn log_record_serde() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-10-01T12:00:00Z".into(),
            level: "WARN".into(),
            target: "coach_engine".into(),
            message: "credit service unreachable".into(),
            fields: None,
            trace_id: Some("trace_1".into()),
            user_id: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.trace_id.as_deref(), Some("trace_1"));
    }
}
