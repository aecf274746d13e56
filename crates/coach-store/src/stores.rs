//! Seams to the backing services. The engine only talks to these traits;
//! the SQLite repos in this crate are one implementation.

use async_trait::async_trait;

use coach_core::conversation::ConversationWindow;
use coach_core::credits::{ConsumeResult, CreditStatus, Feature};
use coach_core::ids::{ConversationKey, TraceId, UserId};
use coach_core::messages::ChatMessage;
use coach_core::shadow::ShadowSuggestion;
use coach_core::traces::TraceEvent;

use crate::error::StoreError;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Current window; an unknown conversation is an empty window.
    async fn load(&self, key: &ConversationKey) -> Result<ConversationWindow, StoreError>;

    /// Append one message, creating the conversation on first use.
    async fn append(
        &self,
        key: &ConversationKey,
        message: &ChatMessage,
    ) -> Result<ConversationWindow, StoreError>;

    /// Replace the rolling summary and drop the oldest `folded` messages.
    async fn fold(
        &self,
        key: &ConversationKey,
        summary: &str,
        folded: usize,
    ) -> Result<ConversationWindow, StoreError>;

    async fn clear(&self, key: &ConversationKey) -> Result<(), StoreError>;
}

/// The remote credit service.
#[async_trait]
pub trait CreditsRpc: Send + Sync {
    async fn get_status(&self, user_id: &UserId) -> Result<CreditStatus, StoreError>;

    /// Check (`deduct = false`) or atomically check-and-deduct the cost of `feature`.
    async fn consume_for_feature(
        &self,
        user_id: &UserId,
        feature: Feature,
        deduct: bool,
    ) -> Result<ConsumeResult, StoreError>;
}

/// Append-only trace event log.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn append(&self, event: &TraceEvent) -> Result<(), StoreError>;

    async fn events_for(&self, trace_id: &TraceId) -> Result<Vec<TraceEvent>, StoreError>;
}

#[async_trait]
pub trait ShadowStore: Send + Sync {
    async fn put(&self, suggestion: &ShadowSuggestion) -> Result<(), StoreError>;

    async fn get(&self, trace_id: &TraceId) -> Result<Option<ShadowSuggestion>, StoreError>;
}
