use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TraceId;

/// Soft suggestions computed asynchronously for a trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShadowSuggestion {
    pub trace_id: TraceId,
    pub suggestions: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl ShadowSuggestion {
    /// A suggestion that expires `ttl` from now.
    pub fn new(trace_id: TraceId, suggestions: Vec<String>, ttl: std::time::Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            trace_id,
            suggestions,
            expires_at,
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
