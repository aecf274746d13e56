use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use coach_core::ids::TraceId;
use coach_core::shadow::ShadowSuggestion;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_time, parse_json, parse_time};
use crate::stores::ShadowStore;

/// Shadow suggestions keyed by trace. Expired rows are returned as stored;
/// callers decide liveness.
pub struct ShadowRepo {
    db: Database,
}

impl ShadowRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn upsert(&self, suggestion: &ShadowSuggestion) -> Result<(), StoreError> {
        let suggestions = serde_json::to_string(&suggestion.suggestions)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO shadow_suggestions (trace_id, suggestions, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(trace_id) DO UPDATE SET suggestions = ?2, expires_at = ?3",
                rusqlite::params![
                    suggestion.trace_id.as_str(),
                    suggestions,
                    format_time(&suggestion.expires_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn find(&self, trace_id: &TraceId) -> Result<Option<ShadowSuggestion>, StoreError> {
        let row: Option<(String, String)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT suggestions, expires_at FROM shadow_suggestions WHERE trace_id = ?1",
                    [trace_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;

        row.map(|(suggestions, expires_at)| {
            Ok(ShadowSuggestion {
                trace_id: trace_id.clone(),
                suggestions: parse_json(&suggestions, "shadow_suggestions", "suggestions")?,
                expires_at: parse_time(&expires_at, "shadow_suggestions", "expires_at")?,
            })
        })
        .transpose()
    }

    /// Delete rows that expired at or before `now`.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM shadow_suggestions WHERE expires_at <= ?1",
                [format_time(&now)],
            )?)
        })
    }
}

#[async_trait]
impl ShadowStore for ShadowRepo {
    async fn put(&self, suggestion: &ShadowSuggestion) -> Result<(), StoreError> {
        self.upsert(suggestion)
    }

    async fn get(&self, trace_id: &TraceId) -> Result<Option<ShadowSuggestion>, StoreError> {
        self.find(trace_id)
    }
}
