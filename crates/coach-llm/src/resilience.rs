use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use coach_core::errors::GuardError;
use coach_core::settings::ResilienceSettings;
use coach_telemetry::MetricsRecorder;

#[derive(Debug, Default)]
struct CircuitState {
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Point-in-time view of the circuit breaker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub failure_count: u32,
    pub open: bool,
    /// Time until the failure count resets, if any failure is recorded.
    pub resets_in: Option<Duration>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Holds one concurrency slot; released exactly once on drop, whatever way
/// the guarded future ends.
struct SlotPermit<'a> {
    active: &'a AtomicUsize,
}

impl Drop for SlotPermit<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Circuit breaker, token bucket and concurrency limiter around an outbound call.
///
/// Checks run outermost first:
/// - circuit: after `failure_threshold` failures, calls fail fast until
///   `backoff(failures)` has passed since the last failure
/// - rate: one token per call, refilled continuously; an empty bucket rejects
/// - concurrency: waits (polling) for one of `max_concurrent` slots
///
/// State lives on the instance, so share a guard through `Arc` to share limits.
pub struct ResilienceGuard {
    settings: ResilienceSettings,
    circuit: Mutex<CircuitState>,
    bucket: Mutex<TokenBucket>,
    active: AtomicUsize,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ResilienceGuard {
    pub fn new(settings: ResilienceSettings) -> Self {
        let bucket = TokenBucket::full(settings.rate_capacity);
        Self {
            settings,
            circuit: Mutex::new(CircuitState::default()),
            bucket: Mutex::new(bucket),
            active: AtomicUsize::new(0),
            metrics: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ResilienceSettings::default())
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    /// Run `f` under all three limits.
    ///
    /// Rejections never invoke `f`. An error from `f` counts toward the circuit
    /// and comes back as [`GuardError::Upstream`].
    pub async fn with_resilience<F, Fut, T, E>(&self, f: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let Err(retry_after) = self.check_circuit() {
            warn!(
                retry_after_ms = retry_after.as_millis() as u64,
                "circuit open, rejecting call"
            );
            self.count_rejection("circuit_open");
            return Err(GuardError::CircuitOpen { retry_after });
        }

        if !self.try_take_token() {
            warn!("rate limit exceeded, rejecting call");
            self.count_rejection("rate_exceeded");
            return Err(GuardError::RateExceeded);
        }

        let _permit = self.acquire_slot().await;
        let started = Instant::now();
        let result = f().await;
        let elapsed_ms = started.elapsed().as_millis() as f64;

        if let Some(m) = &self.metrics {
            m.histogram_observe("guard.call.duration_ms", &[], elapsed_ms);
        }

        match result {
            Ok(value) => {
                self.count_call("ok");
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e);
                self.count_call("error");
                Err(GuardError::Upstream(e))
            }
        }
    }

    /// `min(max_backoff, recovery_timeout * multiplier^(failures - threshold))`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let s = &self.settings;
        let exponent = i64::from(failures) - i64::from(s.failure_threshold);
        let exponent = exponent.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let ms = s.recovery_timeout_ms as f64 * s.backoff_multiplier.powi(exponent);
        let capped = ms.min(s.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        let state = self.circuit.lock();
        let resets_in = state.last_failure.map(|last| {
            self.backoff(state.failure_count)
                .saturating_sub(last.elapsed())
        });
        let expired = resets_in.is_some_and(|d| d.is_zero());
        CircuitSnapshot {
            failure_count: if expired { 0 } else { state.failure_count },
            open: !expired && state.failure_count >= self.settings.failure_threshold,
            resets_in: resets_in.filter(|d| !d.is_zero()),
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.settings.rate_capacity, self.settings.refill_per_sec);
        bucket.tokens
    }

    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reset the failure count once the backoff has passed; reject while open.
    fn check_circuit(&self) -> Result<(), Duration> {
        let mut state = self.circuit.lock();
        let Some(last) = state.last_failure else {
            return Ok(());
        };

        let backoff = self.backoff(state.failure_count);
        let elapsed = last.elapsed();
        if elapsed > backoff {
            if state.failure_count >= self.settings.failure_threshold {
                info!(
                    failures = state.failure_count,
                    "circuit closed after backoff elapsed"
                );
            }
            *state = CircuitState::default();
            return Ok(());
        }

        if state.failure_count >= self.settings.failure_threshold {
            return Err(backoff.saturating_sub(elapsed));
        }
        Ok(())
    }

    fn record_failure(&self, error: &dyn Display) {
        let mut state = self.circuit.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure = Some(Instant::now());

        let failures = state.failure_count;
        if failures == self.settings.failure_threshold {
            warn!(
                failures,
                backoff_ms = self.backoff(failures).as_millis() as u64,
                error = %error,
                "circuit opened after {} consecutive failures",
                failures
            );
        } else {
            debug!(failures, error = %error, "guarded call failed");
        }
    }

    fn try_take_token(&self) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.settings.rate_capacity, self.settings.refill_per_sec);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    async fn acquire_slot(&self) -> SlotPermit<'_> {
        let max = self.settings.max_concurrent;
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current < max {
                if self
                    .active
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return SlotPermit {
                        active: &self.active,
                    };
                }
                continue;
            }
            tokio::time::sleep(self.settings.concurrency_poll()).await;
        }
    }

    fn count_call(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("guard.calls", &[("outcome", outcome)], 1);
        }
    }

    fn count_rejection(&self, reason: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("guard.rejections", &[("reason", reason)], 1);
        }
    }
}
