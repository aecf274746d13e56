//! One user's conversation with one coach: the turn pipeline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use coach_core::credits::{ConsumeResult, Feature};
use coach_core::errors::GuardError;
use coach_core::ids::{CoachId, TraceId, UserId};
use coach_core::messages::ChatMessage;
use coach_core::provider::ChatModel;
use coach_core::settings::CoachSettings;
use coach_core::traces::StageStatus;
use coach_llm::GuardedModel;
use coach_store::TraceStore;
use coach_telemetry::MetricsRecorder;

use crate::anti_repeat::{AntiRepeatGuard, ReplyHistory, ReplyKind};
use crate::credits::{Admission, CreditMeter, Gate};
use crate::error::EngineError;
use crate::memory::{render_prompt_context, ConversationMemoryManager};
use crate::shadow::ShadowSignalScheduler;
use crate::traces::TraceRecorder;

/// Everything a session is assembled from.
pub struct SessionParts<M: ChatModel> {
    pub user_id: UserId,
    pub coach_id: CoachId,
    pub model: Arc<GuardedModel<M>>,
    pub memory: Arc<ConversationMemoryManager>,
    pub anti_repeat: AntiRepeatGuard,
    pub credits: CreditMeter,
    pub traces: Arc<dyn TraceStore>,
    pub shadow: ShadowSignalScheduler,
    /// Replacement replies offered to the anti-repeat guard, in preference order.
    pub fallbacks: Vec<String>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub settings: CoachSettings,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnReply {
    pub trace_id: TraceId,
    pub text: String,
    /// The model's reply repeated a recent one and was replaced.
    pub substituted: bool,
    pub needs_compression: bool,
    /// `None` when the credit service could not be reached to meter the turn.
    pub credits: Option<ConsumeResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    Replied(TurnReply),
    UpgradeRequired {
        trace_id: TraceId,
        result: ConsumeResult,
    },
    /// The guard refused the model call; nothing was sent upstream.
    Busy {
        trace_id: TraceId,
        retry_after: Option<Duration>,
        message: &'static str,
    },
}

impl TurnOutcome {
    pub fn trace_id(&self) -> &TraceId {
        match self {
            Self::Replied(r) => &r.trace_id,
            Self::UpgradeRequired { trace_id, .. } | Self::Busy { trace_id, .. } => trace_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Replied(_) => "replied",
            Self::UpgradeRequired { .. } => "upgrade_required",
            Self::Busy { .. } => "busy",
        }
    }
}

pub struct CoachSession<M: ChatModel> {
    user_id: UserId,
    coach_id: CoachId,
    model: Arc<GuardedModel<M>>,
    memory: Arc<ConversationMemoryManager>,
    anti_repeat: AntiRepeatGuard,
    credits: CreditMeter,
    traces: Arc<dyn TraceStore>,
    shadow: ShadowSignalScheduler,
    fallbacks: Vec<String>,
    metrics: Option<Arc<MetricsRecorder>>,
    settings: CoachSettings,
    history: Mutex<ReplyHistory>,
    turn_cancel: Mutex<CancellationToken>,
}

impl<M: ChatModel> CoachSession<M> {
    pub fn new(parts: SessionParts<M>) -> Self {
        let history = ReplyHistory::new(parts.settings.anti_repeat.window);
        Self {
            user_id: parts.user_id,
            coach_id: parts.coach_id,
            model: parts.model,
            memory: parts.memory,
            anti_repeat: parts.anti_repeat,
            credits: parts.credits,
            traces: parts.traces,
            shadow: parts.shadow,
            fallbacks: parts.fallbacks,
            metrics: parts.metrics,
            settings: parts.settings,
            history: Mutex::new(history),
            turn_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn coach_id(&self) -> &CoachId {
        &self.coach_id
    }

    pub fn credits(&self) -> &CreditMeter {
        &self.credits
    }

    pub fn shadow(&self) -> &ShadowSignalScheduler {
        &self.shadow
    }

    pub fn memory(&self) -> &ConversationMemoryManager {
        &self.memory
    }

    /// Abort the turn in flight, if any.
    pub fn cancel_turn(&self) {
        self.turn_cancel.lock().cancel();
    }

    /// Drop the stored conversation, the reply history and any chips.
    pub async fn clear_conversation(&self) -> Result<(), EngineError> {
        self.cancel_turn();
        self.shadow.clear_shadow_trace_id();
        *self.history.lock() = ReplyHistory::new(self.settings.anti_repeat.window);
        self.memory.clear(&self.user_id, &self.coach_id).await?;
        info!(user_id = %self.user_id, coach_id = %self.coach_id, "conversation cleared");
        Ok(())
    }

    /// Run one user turn. A new turn cancels the previous one.
    #[instrument(skip_all, fields(user_id = %self.user_id, coach_id = %self.coach_id, trace_id = tracing::field::Empty))]
    pub async fn handle_turn(&self, text: &str) -> Result<TurnOutcome, EngineError> {
        let cancel = CancellationToken::new();
        {
            let mut current = self.turn_cancel.lock();
            current.cancel();
            *current = cancel.clone();
        }
        let trace_id = TraceId::new();
        tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
        let recorder = TraceRecorder::new(self.traces.clone(), trace_id.clone())
            .with_owner(&self.user_id, &self.coach_id);
        self.shadow.clear_chips();

        let started = Instant::now();
        let result = self.run_turn(text, &recorder, &cancel).await;
        let total_ms = elapsed_ms(started);

        let label = match &result {
            Ok(outcome) => {
                recorder
                    .record("turn", StageStatus::Ok, Some(total_ms), json!({ "outcome": outcome.label() }))
                    .await;
                if matches!(outcome, TurnOutcome::Replied(_)) {
                    self.shadow
                        .schedule_chips(trace_id.clone(), self.settings.shadow.chip_delay());
                }
                outcome.label()
            }
            Err(e) => {
                recorder
                    .record("turn", StageStatus::Error, Some(total_ms), json!({ "error": e.to_string() }))
                    .await;
                match e {
                    EngineError::Aborted => "aborted",
                    _ => "error",
                }
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("session.turns", &[("outcome", label)], 1);
            metrics.histogram_observe("session.turn.duration_ms", &[], total_ms as f64);
        }
        debug!(outcome = label, total_ms, "turn finished");
        result
    }

    async fn run_turn(
        &self,
        text: &str,
        recorder: &TraceRecorder,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let trace_id = recorder.trace_id().clone();

        let stage = Instant::now();
        let admission = self.credits.allows(Feature::ChatMessage, Gate::Soft).await;
        recorder
            .record(
                "credits_check",
                StageStatus::Ok,
                Some(elapsed_ms(stage)),
                json!({ "allowed": admission.is_allowed(), "verified": !matches!(admission, Admission::Unverified(_)) }),
            )
            .await;
        if let Admission::Denied(result) = admission {
            info!(cost = result.cost, remaining = result.credits_remaining, "turn needs more credits");
            return Ok(TurnOutcome::UpgradeRequired { trace_id, result });
        }

        let stage = Instant::now();
        let context = self.memory.get_context(&self.user_id, &self.coach_id).await;
        let prompt = build_prompt(&render_prompt_context(&context), text);
        recorder
            .record(
                "context",
                StageStatus::Ok,
                Some(elapsed_ms(stage)),
                json!({ "recent": context.recent_messages.len(), "has_summary": context.summary.is_some() }),
            )
            .await;

        let stage = Instant::now();
        let completion = tokio::select! {
            _ = cancel.cancelled() => {
                recorder.record("model", StageStatus::Error, Some(elapsed_ms(stage)), json!({ "aborted": true })).await;
                return Err(EngineError::Aborted);
            }
            r = self.model.complete(&prompt, &context.recent_messages) => r,
        };
        let candidate = match completion {
            Ok(reply) => {
                recorder
                    .record("model", StageStatus::Ok, Some(elapsed_ms(stage)), json!({ "model": self.model.name() }))
                    .await;
                reply
            }
            Err(e) if e.is_rejection() => {
                recorder
                    .record("model", StageStatus::Error, Some(elapsed_ms(stage)), json!({ "rejected": e.error_kind() }))
                    .await;
                return Ok(TurnOutcome::Busy {
                    trace_id,
                    retry_after: e.retry_after(),
                    message: e.user_message().unwrap_or("service busy, retry shortly"),
                });
            }
            Err(GuardError::Upstream(e)) => {
                recorder
                    .record("model", StageStatus::Error, Some(elapsed_ms(stage)), json!({ "error": e.error_kind() }))
                    .await;
                return Err(EngineError::Upstream(e));
            }
            Err(e) => return Err(EngineError::Internal(e.to_string())),
        };

        let history = self.history.lock().entries().to_vec();
        let substituted = self.anti_repeat.is_redundant(&candidate, &history);
        let reply = if substituted {
            self.anti_repeat.generate_alternative(&candidate, &self.fallbacks)
        } else {
            candidate
        };
        recorder
            .record("anti_repeat", StageStatus::Ok, None, json!({ "substituted": substituted }))
            .await;

        let stage = Instant::now();
        let mut needs_compression = false;
        let mut persisted = true;
        for message in [ChatMessage::user(text), ChatMessage::coach(reply.clone())] {
            match self.memory.add_message(&self.user_id, &self.coach_id, message).await {
                Ok(outcome) => needs_compression |= outcome.needs_compression,
                Err(e) => {
                    warn!(error = %e, "failed to persist turn messages");
                    persisted = false;
                    break;
                }
            }
        }
        let persist_status = if persisted { StageStatus::Ok } else { StageStatus::Error };
        recorder
            .record("persist", persist_status, Some(elapsed_ms(stage)), json!({ "needs_compression": needs_compression }))
            .await;

        let stage = Instant::now();
        let credits = match self.credits.consume(Feature::ChatMessage).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "turn not metered, credit service unavailable");
                None
            }
        };
        recorder
            .record(
                "credits_consume",
                if credits.is_some() { StageStatus::Ok } else { StageStatus::Error },
                Some(elapsed_ms(stage)),
                json!({ "remaining": credits.as_ref().map(|c| c.credits_remaining) }),
            )
            .await;

        let kind = if substituted { ReplyKind::Alternative } else { ReplyKind::Model };
        self.history.lock().record(reply.clone(), kind);

        Ok(TurnOutcome::Replied(TurnReply {
            trace_id,
            text: reply,
            substituted,
            needs_compression,
            credits,
        }))
    }
}

fn build_prompt(context: &str, text: &str) -> String {
    if context.is_empty() {
        format!("user: {text}")
    } else {
        format!("{context}\n\nuser: {text}")
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
