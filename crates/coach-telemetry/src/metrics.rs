use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Histogram,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Histogram => "histogram",
        }
    }
}

/// A persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub kind: MetricKind,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

impl HistogramSummary {
    fn from_observations(obs: &[f64]) -> Self {
        if obs.is_empty() {
            return Self::default();
        }
        let mut sorted = obs.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        Self {
            count: n as u64,
            sum: sorted.iter().sum(),
            max: sorted[n - 1],
            p50: at(0.5),
            p95: at(0.95),
        }
    }
}

/// Metric name plus labels sorted by key, so label order never splits a series.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Thread-safe in-process metrics with SQLite snapshots for history.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    histograms: RwLock<HashMap<MetricKey, Mutex<Vec<f64>>>>,
    db: Option<Mutex<Connection>>,
}

impl MetricsRecorder {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Recorder whose snapshots live only as long as the process.
    pub fn in_memory() -> Self {
        Connection::open_in_memory()
            .and_then(Self::with_connection)
            .unwrap_or_else(|_| Self {
                counters: RwLock::new(HashMap::new()),
                histograms: RwLock::new(HashMap::new()),
                db: None,
            })
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 kind TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            db: Some(Mutex::new(conn)),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.lock().push(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(|h| HistogramSummary::from_observations(&h.lock()))
            .unwrap_or_default()
    }

    /// Persist current values; histograms are stored as their p50.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut rows: Vec<(String, f64, Option<String>, MetricKind)> = Vec::new();
        for (key, counter) in self.counters.read().iter() {
            rows.push((
                key.name.clone(),
                counter.load(Ordering::Relaxed) as f64,
                key.labels_json(),
                MetricKind::Counter,
            ));
        }
        for (key, obs) in self.histograms.read().iter() {
            let summary = HistogramSummary::from_observations(&obs.lock());
            rows.push((key.name.clone(), summary.p50, key.labels_json(), MetricKind::Histogram));
        }

        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut db = db.lock();
        let tx = db.transaction()?;
        for (name, value, labels, kind) in &rows {
            tx.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![now, name, value, labels, kind.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let db = db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, kind FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(name) = &q.name {
            params.push(name.clone());
            sql.push_str(&format!(" AND name = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let kind: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                kind: if kind == "histogram" {
                    MetricKind::Histogram
                } else {
                    MetricKind::Counter
                },
            })
        })?;
        rows.collect()
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        let Some(db) = &self.db else {
            return Ok(0);
        };
        db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp <= ?1",
            rusqlite::params![cutoff],
        )
    }
}
