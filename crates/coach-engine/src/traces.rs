//! Roll-up of multi-stage pipeline events into one debuggable bundle.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use coach_core::ids::{CoachId, TraceId, UserId};
use coach_core::settings::TraceSettings;
use coach_core::traces::{BundleStatus, StageStatus, TraceBundle, TraceEvent};
use coach_store::TraceStore;

use crate::poll::{poll_until, PollConfig, PollOutcome};

const PROMPT_STAGE_MARKERS: [&str; 4] = ["prompt", "llm", "context", "rag"];

/// Total order over events so that aggregation ignores arrival order.
fn event_order(a: &TraceEvent, b: &TraceEvent) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.stage.cmp(&b.stage))
        .then_with(|| a.status.cmp(&b.status))
        .then_with(|| a.latency_ms.cmp(&b.latency_ms))
        .then_with(|| a.payload.to_string().cmp(&b.payload.to_string()))
        .then_with(|| a.trace_id.cmp(&b.trace_id))
        .then_with(|| a.user_id.cmp(&b.user_id))
        .then_with(|| a.coach_id.cmp(&b.coach_id))
}

/// Build the bundle for one trace's events. `None` when there are no events.
///
/// Status is red on any error, yellow while running or when any stage took
/// `sla_ms` or longer, green otherwise.
pub fn aggregate(events: &[TraceEvent], sla_ms: u64) -> Option<TraceBundle> {
    let mut stages = events.to_vec();
    stages.sort_by(event_order);
    let first = stages.first()?;
    let trace_id = first.trace_id.clone();
    let started_at = first.timestamp;
    let last_event_at = stages.last()?.timestamp;

    let max_latency_ms = stages.iter().filter_map(|e| e.latency_ms).max().unwrap_or(0);
    let has_error = stages.iter().any(|e| e.status == StageStatus::Error);
    let running = !has_error && stages.iter().any(|e| e.status == StageStatus::Running);
    let has_prompt_data = stages.iter().any(|e| {
        let stage = e.stage.to_lowercase();
        PROMPT_STAGE_MARKERS.iter().any(|m| stage.contains(m))
    });

    let status = if has_error {
        BundleStatus::Red
    } else if running || max_latency_ms >= sla_ms {
        BundleStatus::Yellow
    } else {
        BundleStatus::Green
    };

    Some(TraceBundle {
        trace_id,
        user_id: stages.iter().find_map(|e| e.user_id.clone()),
        coach_id: stages.iter().find_map(|e| e.coach_id.clone()),
        started_at,
        last_event_at,
        status,
        max_latency_ms,
        has_error,
        running,
        has_prompt_data,
        stages,
    })
}

#[derive(Clone, Copy, Debug)]
pub struct TraceAggregator {
    sla_ms: u64,
}

impl TraceAggregator {
    pub fn new(sla_ms: u64) -> Self {
        Self { sla_ms }
    }

    pub fn aggregate(&self, events: &[TraceEvent]) -> Option<TraceBundle> {
        aggregate(events, self.sla_ms)
    }
}

impl Default for TraceAggregator {
    fn default() -> Self {
        Self::new(TraceSettings::default().sla_ms)
    }
}

/// Read side: bundles straight from the trace store.
pub struct TraceInspector {
    store: Arc<dyn TraceStore>,
    aggregator: TraceAggregator,
    poll: PollConfig,
}

impl TraceInspector {
    pub fn new(store: Arc<dyn TraceStore>, settings: &TraceSettings) -> Self {
        Self {
            store,
            aggregator: TraceAggregator::new(settings.sla_ms),
            poll: PollConfig::new(settings.poll_interval(), settings.max_poll_attempts),
        }
    }

    /// Current bundle. Read failures are treated as "no data".
    pub async fn load(&self, trace_id: &TraceId) -> Option<TraceBundle> {
        match self.store.events_for(trace_id).await {
            Ok(events) => self.aggregator.aggregate(&events),
            Err(e) => {
                warn!(trace_id = %trace_id, error = %e, "trace read failed");
                None
            }
        }
    }

    /// Poll until the trace is no longer running.
    pub async fn watch(
        &self,
        trace_id: &TraceId,
        cancel: &CancellationToken,
    ) -> PollOutcome<Option<TraceBundle>> {
        poll_until(
            self.poll,
            cancel,
            || self.load(trace_id),
            |bundle| bundle.as_ref().is_some_and(|b| !b.running),
        )
        .await
    }
}

/// Write side: stage events for one turn.
pub struct TraceRecorder {
    store: Arc<dyn TraceStore>,
    trace_id: TraceId,
    owner: Option<(UserId, CoachId)>,
}

impl TraceRecorder {
    pub fn new(store: Arc<dyn TraceStore>, trace_id: TraceId) -> Self {
        Self {
            store,
            trace_id,
            owner: None,
        }
    }

    pub fn with_owner(mut self, user_id: &UserId, coach_id: &CoachId) -> Self {
        self.owner = Some((user_id.clone(), coach_id.clone()));
        self
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Append one stage event. A failed write is logged and dropped; tracing
    /// never fails a turn.
    pub async fn record(
        &self,
        stage: &str,
        status: StageStatus,
        latency_ms: Option<u64>,
        payload: Value,
    ) {
        let mut event = TraceEvent::new(&self.trace_id, stage, status).with_payload(payload);
        if let Some(ms) = latency_ms {
            event = event.with_latency(ms);
        }
        if let Some((user_id, coach_id)) = &self.owner {
            event = event.with_owner(user_id, coach_id);
        }
        if let Err(e) = self.store.append(&event).await {
            warn!(trace_id = %self.trace_id, stage, error = %e, "failed to record trace event");
        }
    }
}
