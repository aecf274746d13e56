use async_trait::async_trait;
use tracing::instrument;

use coach_core::ids::{CoachId, TraceId, UserId};
use coach_core::traces::{StageStatus, TraceEvent};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_time, get, parse_enum, parse_json, parse_time};
use crate::stores::TraceStore;

/// Append-only pipeline event log. Rows are never updated.
pub struct TraceRepo {
    db: Database,
}

impl TraceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, event), fields(trace_id = %event.trace_id, stage = %event.stage))]
    pub fn insert(&self, event: &TraceEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&event.payload)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trace_events (trace_id, user_id, coach_id, timestamp, stage, status, latency_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    event.trace_id.as_str(),
                    event.user_id.as_ref().map(UserId::as_str),
                    event.coach_id.as_ref().map(CoachId::as_str),
                    format_time(&event.timestamp),
                    event.stage,
                    event.status.to_string(),
                    event.latency_ms.map(|ms| ms as i64),
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    /// Events of one trace in insertion order.
    pub fn list(&self, trace_id: &TraceId) -> Result<Vec<TraceEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT trace_id, user_id, coach_id, timestamp, stage, status, latency_ms, payload
                 FROM trace_events WHERE trace_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([trace_id.as_str()])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
    }

    /// Most recent trace ids for a user, newest first.
    pub fn recent_trace_ids(&self, user_id: &UserId, limit: u32) -> Result<Vec<TraceId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT trace_id FROM trace_events WHERE user_id = ?1
                 GROUP BY trace_id ORDER BY MAX(id) DESC LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(rusqlite::params![user_id.as_str(), limit], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(TraceId::from_raw).collect())
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<TraceEvent, StoreError> {
    const T: &str = "trace_events";
    let timestamp: String = get(row, 3, T, "timestamp")?;
    let status: String = get(row, 5, T, "status")?;
    let latency: Option<i64> = get(row, 6, T, "latency_ms")?;
    let payload: String = get(row, 7, T, "payload")?;
    Ok(TraceEvent {
        trace_id: TraceId::from_raw(get::<String>(row, 0, T, "trace_id")?),
        user_id: get::<Option<String>>(row, 1, T, "user_id")?.map(UserId::from_raw),
        coach_id: get::<Option<String>>(row, 2, T, "coach_id")?.map(CoachId::from_raw),
        timestamp: parse_time(&timestamp, T, "timestamp")?,
        stage: get(row, 4, T, "stage")?,
        status: parse_enum::<StageStatus>(&status, T, "status")?,
        latency_ms: latency.map(|ms| ms.max(0) as u64),
        payload: parse_json(&payload, T, "payload")?,
    })
}

#[async_trait]
impl TraceStore for TraceRepo {
    async fn append(&self, event: &TraceEvent) -> Result<(), StoreError> {
        self.insert(event)
    }

    async fn events_for(&self, trace_id: &TraceId) -> Result<Vec<TraceEvent>, StoreError> {
        self.list(trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn repo() -> TraceRepo {
        TraceRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn insert_and_list_round_trip() {
        let repo = repo();
        let trace = TraceId::from_raw("trace_1");
        let user = UserId::from_raw("user_a");
        let coach = CoachId::from_raw("coach_fit");

        let event = TraceEvent::new(&trace, "llm_call", StageStatus::Ok)
            .at(Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap())
            .with_owner(&user, &coach)
            .with_latency(840)
            .with_payload(json!({"model": "mock"}));
        repo.insert(&event).unwrap();
        repo.insert(&TraceEvent::new(&trace, "persist", StageStatus::Running)).unwrap();

        let events = repo.list(&trace).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], event);
        assert_eq!(events[1].status, StageStatus::Running);
        assert!(events[1].user_id.is_none());
        assert!(events[1].payload.is_null());
    }

    #[test]
    fn traces_do_not_mix() {
        let repo = repo();
        repo.insert(&TraceEvent::new(&TraceId::from_raw("a"), "x", StageStatus::Ok)).unwrap();
        repo.insert(&TraceEvent::new(&TraceId::from_raw("b"), "y", StageStatus::Ok)).unwrap();
        assert_eq!(repo.list(&TraceId::from_raw("a")).unwrap().len(), 1);
        assert!(repo.list(&TraceId::from_raw("missing")).unwrap().is_empty());
    }

    #[test]
    fn recent_trace_ids_newest_first() {
        let repo = repo();
        let user = UserId::from_raw("user_a");
        let coach = CoachId::from_raw("coach_fit");
        for id in ["t1", "t2", "t3"] {
            repo.insert(
                &TraceEvent::new(&TraceId::from_raw(id), "turn", StageStatus::Ok)
                    .with_owner(&user, &coach),
            )
            .unwrap();
        }
        let ids = repo.recent_trace_ids(&user, 2).unwrap();
        assert_eq!(ids, vec![TraceId::from_raw("t3"), TraceId::from_raw("t2")]);
    }

    #[test]
    fn corrupt_status_is_reported() {
        let repo = repo();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO trace_events (trace_id, timestamp, stage, status, payload)
                     VALUES ('bad', '2026-10-01T00:00:00.000000Z', 'llm', 'MAYBE', 'null')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            repo.list(&TraceId::from_raw("bad")),
            Err(StoreError::CorruptRow { column: "status", .. })
        ));
    }
}
