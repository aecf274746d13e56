use std::sync::Arc;

use coach_core::errors::{GuardError, ModelError};
use coach_core::messages::ChatMessage;
use coach_core::provider::ChatModel;

use crate::resilience::ResilienceGuard;

/// A [`ChatModel`] whose calls all go through one [`ResilienceGuard`].
///
/// The guard is shared, so several models (or sessions) behind the same
/// `Arc<ResilienceGuard>` share one circuit, bucket and slot pool.
pub struct GuardedModel<M: ChatModel> {
    inner: M,
    guard: Arc<ResilienceGuard>,
}

impl<M: ChatModel> GuardedModel<M> {
    pub fn new(inner: M, guard: Arc<ResilienceGuard>) -> Self {
        Self { inner, guard }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn guard(&self) -> &ResilienceGuard {
        &self.guard
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub async fn complete(
        &self,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, GuardError<ModelError>> {
        self.guard
            .with_resilience(|| self.inner.complete(prompt, history))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockModel, MockReply};
    use coach_core::settings::ResilienceSettings;

    #[tokio::test(start_paused = true)]
    async fn delegates_and_shares_guard() {
        let guard = Arc::new(ResilienceGuard::new(ResilienceSettings {
            failure_threshold: 2,
            ..Default::default()
        }));
        let model = GuardedModel::new(
            MockModel::new(vec![
                MockReply::Error(ModelError::Overloaded),
                MockReply::Error(ModelError::Network("reset".into())),
                MockReply::text("unreachable"),
            ]),
            guard.clone(),
        );
        assert_eq!(model.name(), "mock");

        assert!(matches!(
            model.complete("hi", &[]).await,
            Err(GuardError::Upstream(ModelError::Overloaded))
        ));
        assert!(matches!(
            model.complete("hi", &[]).await,
            Err(GuardError::Upstream(ModelError::Network(_)))
        ));
        let rejected = model.complete("hi", &[]).await.unwrap_err();
        assert_eq!(rejected.user_message(), Some("service busy, retry shortly"));
        assert_eq!(model.inner().call_count(), 2);
        assert!(guard.circuit_snapshot().open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_text() {
        let guard = Arc::new(ResilienceGuard::with_defaults());
        let model = GuardedModel::new(MockModel::new(vec![MockReply::text("keep going")]), guard);
        let history = vec![ChatMessage::user("hi")];
        assert_eq!(model.complete("prompt", &history).await.unwrap(), "keep going");
    }
}
