//! Delayed, cancellable surfacing of shadow suggestion chips.
//!
//! A turn schedules chips for its trace; when the delay elapses the scheduler
//! reads the stored suggestion and publishes up to `max_suggestions` of them,
//! unless the suggestion has expired or the schedule was cleared first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use coach_core::ids::TraceId;
use coach_core::settings::ShadowSettings;
use coach_core::shadow::ShadowSuggestion;
use coach_store::{ShadowStore, StoreError};

#[derive(Default)]
struct ShadowState {
    trace_id: Option<TraceId>,
    pending: Option<CancellationToken>,
    /// Bumped by every schedule and clear; a timer only publishes if its
    /// generation is still current.
    generation: u64,
}

impl ShadowState {
    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
        self.generation += 1;
    }
}

pub struct ShadowSignalScheduler {
    store: Arc<dyn ShadowStore>,
    settings: ShadowSettings,
    state: Arc<Mutex<ShadowState>>,
    chips: Arc<watch::Sender<Vec<String>>>,
}

impl ShadowSignalScheduler {
    pub fn new(store: Arc<dyn ShadowStore>, settings: ShadowSettings) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            store,
            settings,
            state: Arc::new(Mutex::new(ShadowState::default())),
            chips: Arc::new(tx),
        }
    }

    /// Store suggestions for `trace_id`, live for the configured TTL.
    pub async fn publish(&self, trace_id: TraceId, suggestions: Vec<String>) -> Result<(), StoreError> {
        let suggestion = ShadowSuggestion::new(trace_id, suggestions, self.settings.suggestion_ttl());
        debug!(trace_id = %suggestion.trace_id, expires_at = %suggestion.expires_at, "storing shadow suggestion");
        self.store.put(&suggestion).await
    }

    /// Schedule with the configured default delay.
    pub fn schedule(&self, trace_id: TraceId) {
        self.schedule_chips(trace_id, self.settings.chip_delay());
    }

    /// Cancel any pending timer and arm a new one for `trace_id`.
    pub fn schedule_chips(&self, trace_id: TraceId, delay: Duration) {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock();
            state.cancel_pending();
            state.trace_id = Some(trace_id.clone());
            state.pending = Some(token.clone());
            state.generation
        };

        let store = self.store.clone();
        let state = self.state.clone();
        let chips = self.chips.clone();
        let max = self.settings.max_suggestions;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let suggestion = match store.get(&trace_id).await {
                Ok(Some(s)) => s,
                Ok(None) => {
                    debug!(trace_id = %trace_id, "no shadow suggestion for trace");
                    return;
                }
                Err(e) => {
                    warn!(trace_id = %trace_id, error = %e, "shadow suggestion read failed");
                    return;
                }
            };
            if !suggestion.is_live_at(Utc::now()) {
                debug!(trace_id = %trace_id, "shadow suggestion expired");
                return;
            }

            let visible: Vec<String> = suggestion
                .suggestions
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .take(max)
                .collect();

            // Checked under the same lock clear() takes, so a clear that wins
            // the race can never be overwritten.
            let mut state = state.lock();
            if token.is_cancelled() || state.generation != generation {
                return;
            }
            state.pending = None;
            debug!(trace_id = %trace_id, count = visible.len(), "surfacing shadow chips");
            chips.send_replace(visible);
        });
    }

    /// Cancel the pending timer and empty the exposed chips.
    pub fn clear_chips(&self) {
        let mut state = self.state.lock();
        state.cancel_pending();
        self.chips.send_replace(Vec::new());
    }

    /// `clear_chips` and forget the trace the chips belonged to.
    pub fn clear_shadow_trace_id(&self) {
        let mut state = self.state.lock();
        state.cancel_pending();
        state.trace_id = None;
        self.chips.send_replace(Vec::new());
    }

    pub fn chips(&self) -> Vec<String> {
        self.chips.borrow().clone()
    }

    pub fn shadow_trace_id(&self) -> Option<TraceId> {
        self.state.lock().trace_id.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.chips.subscribe()
    }
}

impl Drop for ShadowSignalScheduler {
    fn drop(&mut self) {
        self.state.lock().cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeShadow;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;

    async fn store_with(trace: &str, suggestions: &[&str], ttl_secs: i64) -> Arc<FakeShadow> {
        let store = Arc::new(FakeShadow::default());
        store
            .put(&ShadowSuggestion {
                trace_id: TraceId::from_raw(trace),
                suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
                expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn chips_surface_after_delay_capped_and_non_empty() {
        let store = store_with("t1", &["Log lunch", "  ", "Plan workout", "Drink water", "Stretch"], 120).await;
        let scheduler = ShadowSignalScheduler::new(store, ShadowSettings::default());
        let mut rx = scheduler.subscribe();

        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scheduler.chips().is_empty());

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), vec!["Log lunch", "Plan workout", "Drink water"]);
        assert_eq!(scheduler.shadow_trace_id(), Some(TraceId::from_raw("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_before_fire_surfaces_nothing() {
        let store = store_with("t1", &["Log lunch"], 120).await;
        let scheduler = ShadowSignalScheduler::new(store.clone(), ShadowSettings::default());

        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.clear_chips();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(scheduler.chips().is_empty());
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_cancels_previous_timer() {
        let store = store_with("t1", &["old chip"], 120).await;
        store
            .put(&ShadowSuggestion {
                trace_id: TraceId::from_raw("t2"),
                suggestions: vec!["new chip".into()],
                expires_at: Utc::now() + ChronoDuration::seconds(120),
            })
            .await
            .unwrap();
        let scheduler = ShadowSignalScheduler::new(store.clone(), ShadowSettings::default());

        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.schedule_chips(TraceId::from_raw("t2"), Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(scheduler.chips(), vec!["new chip"]);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_suggestion_is_not_surfaced() {
        let store = store_with("t1", &["stale"], -1).await;
        let scheduler = ShadowSignalScheduler::new(store.clone(), ShadowSettings::default());

        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert!(scheduler.chips().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_shadow_trace_id_forgets_trace() {
        let store = store_with("t1", &["Log lunch"], 120).await;
        let scheduler = ShadowSignalScheduler::new(store, ShadowSettings::default());
        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.chips().len(), 1);

        scheduler.clear_shadow_trace_id();
        assert!(scheduler.chips().is_empty());
        assert!(scheduler.shadow_trace_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_suggestion_leaves_chips_empty() {
        let scheduler = ShadowSignalScheduler::new(Arc::new(FakeShadow::default()), ShadowSettings::default());
        scheduler.schedule(TraceId::from_raw("nothing"));
        tokio::time::sleep(Duration::from_millis(7000)).await;
        assert!(scheduler.chips().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn published_suggestion_lives_for_configured_ttl() {
        let store = Arc::new(FakeShadow::default());
        let scheduler = ShadowSignalScheduler::new(store.clone(), ShadowSettings::default());
        let before = Utc::now();
        scheduler
            .publish(TraceId::from_raw("t1"), vec!["Log lunch".into()])
            .await
            .unwrap();

        let stored = store.get(&TraceId::from_raw("t1")).await.unwrap().unwrap();
        assert!(stored.expires_at >= before + ChronoDuration::milliseconds(120_000));

        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.chips(), vec!["Log lunch"]);
    }

    #[tokio::test(start_paused = true)]
    async fn short_ttl_expires_before_chips_fire() {
        let store = Arc::new(FakeShadow::default());
        let settings = ShadowSettings {
            suggestion_ttl_ms: 1,
            ..ShadowSettings::default()
        };
        let scheduler = ShadowSignalScheduler::new(store.clone(), settings);
        scheduler
            .publish(TraceId::from_raw("t1"), vec!["Log lunch".into()])
            .await
            .unwrap();

        let stored = store.get(&TraceId::from_raw("t1")).await.unwrap().unwrap();
        assert!(stored.expires_at < Utc::now() + ChronoDuration::seconds(1));

        // Expiry is wall clock; wait it out for real before the timer reads.
        std::thread::sleep(Duration::from_millis(5));
        scheduler.schedule_chips(TraceId::from_raw("t1"), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.chips().is_empty());
    }
}
