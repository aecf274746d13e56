use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CoachId, TraceId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Ok,
    Running,
    Error,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Running => write!(f, "RUNNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "RUNNING" => Ok(Self::Running),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown stage status: {other}")),
        }
    }
}

/// One pipeline stage event. Never mutated after it is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coach_id: Option<CoachId>,
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TraceEvent {
    pub fn new(trace_id: &TraceId, stage: impl Into<String>, status: StageStatus) -> Self {
        Self {
            trace_id: trace_id.clone(),
            user_id: None,
            coach_id: None,
            timestamp: Utc::now(),
            stage: stage.into(),
            status,
            latency_ms: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_owner(mut self, user_id: &UserId, coach_id: &CoachId) -> Self {
        self.user_id = Some(user_id.clone());
        self.coach_id = Some(coach_id.clone());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Health rollup of a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// Rollup of every event sharing one trace id. Derived, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceBundle {
    pub trace_id: TraceId,
    pub user_id: Option<UserId>,
    pub coach_id: Option<CoachId>,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub stages: Vec<TraceEvent>,
    pub status: BundleStatus,
    pub max_latency_ms: u64,
    pub has_error: bool,
    pub running: bool,
    pub has_prompt_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_wire_format() {
        let json = serde_json::to_string(&StageStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let parsed: StageStatus = "ERROR".parse().unwrap();
        assert_eq!(parsed, StageStatus::Error);
    }

    #[test]
    fn event_builder() {
        let trace = TraceId::from_raw("trace_1");
        let event = TraceEvent::new(&trace, "llm", StageStatus::Ok)
            .with_latency(120)
            .with_owner(&UserId::from_raw("u"), &CoachId::from_raw("c"));
        assert_eq!(event.latency_ms, Some(120));
        assert_eq!(event.user_id.as_ref().map(UserId::as_str), Some("u"));
        assert!(event.payload.is_null());
    }

    #[test]
    fn event_deserializes_without_optional_fields() {
        let json = r#"{"trace_id":"t","timestamp":"2026-10-01T10:00:00Z","stage":"rag","status":"OK"}"#;
        let event: TraceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.stage, "rag");
        assert!(event.latency_ms.is_none());
        assert!(event.user_id.is_none());
    }
}
