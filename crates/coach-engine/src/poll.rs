use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome<T> {
    /// `is_terminal` accepted this value.
    Terminal(T),
    /// Attempts ran out; carries the last value fetched.
    Exhausted(Option<T>),
    Cancelled(Option<T>),
}

impl<T> PollOutcome<T> {
    pub fn into_last(self) -> Option<T> {
        match self {
            Self::Terminal(v) => Some(v),
            Self::Exhausted(v) | Self::Cancelled(v) => v,
        }
    }
}

/// Fetch at a fixed interval until `is_terminal` holds, the attempt cap is
/// reached, or `cancel` fires. The first fetch happens immediately.
pub async fn poll_until<T, F, Fut, P>(
    config: PollConfig,
    cancel: &CancellationToken,
    mut fetch: F,
    is_terminal: P,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let mut last = None;
    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled(last);
        }
        let value = fetch().await;
        if is_terminal(&value) {
            return PollOutcome::Terminal(value);
        }
        last = Some(value);

        if attempt < config.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled(last),
                _ = tokio::time::sleep(config.interval) => {}
            }
        }
    }
    PollOutcome::Exhausted(last)
}
