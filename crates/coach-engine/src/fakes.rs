//! In-memory store doubles with switchable failure, for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use coach_core::conversation::ConversationWindow;
use coach_core::credits::{ConsumeReason, ConsumeResult, CreditStatus, Feature};
use coach_core::ids::{ConversationKey, TraceId, UserId};
use coach_core::messages::ChatMessage;
use coach_core::shadow::ShadowSuggestion;
use coach_core::traces::TraceEvent;
use coach_store::{ConversationStore, CreditsRpc, ShadowStore, StoreError, TraceStore};

fn offline() -> StoreError {
    StoreError::Unavailable("offline".into())
}

#[derive(Default)]
pub struct FakeConversations {
    pub windows: Mutex<HashMap<ConversationKey, ConversationWindow>>,
    pub failing: AtomicBool,
    pub loads: AtomicUsize,
    /// `load` snapshots the window, then waits this long before returning it.
    pub load_delay: Mutex<Option<Duration>>,
}

impl FakeConversations {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(offline())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConversationStore for FakeConversations {
    async fn load(&self, key: &ConversationKey) -> Result<ConversationWindow, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let snapshot = self.windows.lock().get(key).cloned().unwrap_or_default();
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn append(
        &self,
        key: &ConversationKey,
        message: &ChatMessage,
    ) -> Result<ConversationWindow, StoreError> {
        self.check()?;
        let mut windows = self.windows.lock();
        let window = windows.entry(key.clone()).or_default();
        window.recent_messages.push(message.clone());
        window.message_count += 1;
        Ok(window.clone())
    }

    async fn fold(
        &self,
        key: &ConversationKey,
        summary: &str,
        folded: usize,
    ) -> Result<ConversationWindow, StoreError> {
        self.check()?;
        let mut windows = self.windows.lock();
        let window = windows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let folded = folded.min(window.recent_messages.len());
        window.recent_messages.drain(..folded);
        window.summary = Some(summary.to_string());
        Ok(window.clone())
    }

    async fn clear(&self, key: &ConversationKey) -> Result<(), StoreError> {
        self.check()?;
        self.windows.lock().remove(key);
        Ok(())
    }
}

pub struct FakeCredits {
    pub accounts: Mutex<HashMap<UserId, u32>>,
    pub failing: AtomicBool,
    /// `get_status` reads the balance, then waits this long before answering.
    pub status_delay: Mutex<Option<Duration>>,
}

impl FakeCredits {
    pub fn with_balance(user: &UserId, remaining: u32) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(user.clone(), remaining);
        Self {
            accounts: Mutex::new(accounts),
            failing: AtomicBool::new(false),
            status_delay: Mutex::new(None),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn balance(&self, user: &UserId) -> Option<u32> {
        self.accounts.lock().get(user).copied()
    }
}

#[async_trait]
impl CreditsRpc for FakeCredits {
    async fn get_status(&self, user_id: &UserId) -> Result<CreditStatus, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(offline());
        }
        let remaining = self
            .balance(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        let delay = *self.status_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CreditStatus {
            user_id: user_id.clone(),
            remaining,
            monthly_quota: 100,
            reset_month: "2026-10".into(),
        })
    }

    async fn consume_for_feature(
        &self,
        user_id: &UserId,
        feature: Feature,
        deduct: bool,
    ) -> Result<ConsumeResult, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(offline());
        }
        let cost = feature.default_cost();
        let mut accounts = self.accounts.lock();
        let Some(remaining) = accounts.get_mut(user_id) else {
            return Ok(ConsumeResult::denied(ConsumeReason::NoAccount, cost, 0));
        };
        if *remaining < cost {
            return Ok(ConsumeResult::denied(
                ConsumeReason::InsufficientCredits,
                cost,
                *remaining,
            ));
        }
        if deduct {
            *remaining -= cost;
        }
        Ok(ConsumeResult::granted(cost, *remaining))
    }
}

#[derive(Default)]
pub struct FakeTraces {
    pub events: Mutex<Vec<TraceEvent>>,
    pub failing: AtomicBool,
}

impl FakeTraces {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn stages(&self, trace_id: &TraceId) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.trace_id == trace_id)
            .map(|e| e.stage.clone())
            .collect()
    }
}

#[async_trait]
impl TraceStore for FakeTraces {
    async fn append(&self, event: &TraceEvent) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(offline());
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn events_for(&self, trace_id: &TraceId) -> Result<Vec<TraceEvent>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(offline());
        }
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| &e.trace_id == trace_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeShadow {
    pub rows: Mutex<HashMap<TraceId, ShadowSuggestion>>,
    pub reads: AtomicUsize,
}

#[async_trait]
impl ShadowStore for FakeShadow {
    async fn put(&self, suggestion: &ShadowSuggestion) -> Result<(), StoreError> {
        self.rows
            .lock()
            .insert(suggestion.trace_id.clone(), suggestion.clone());
        Ok(())
    }

    async fn get(&self, trace_id: &TraceId) -> Result<Option<ShadowSuggestion>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().get(trace_id).cloned())
    }
}
