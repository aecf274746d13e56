pub mod anti_repeat;
pub mod cache;
pub mod credits;
pub mod error;
pub mod memory;
pub mod poll;
pub mod session;
pub mod shadow;
pub mod traces;

#[cfg(test)]
pub(crate) mod fakes;

pub use anti_repeat::{AntiRepeatGuard, ReplyHistory, ReplyHistoryEntry, ReplyKind};
pub use cache::ReadThroughCache;
pub use credits::{Admission, CreditError, CreditMeter, Gate};
pub use error::EngineError;
pub use memory::{AddMessageOutcome, ConversationContext, ConversationMemoryManager};
pub use poll::{poll_until, PollConfig, PollOutcome};
pub use session::{CoachSession, SessionParts, TurnOutcome, TurnReply};
pub use shadow::ShadowSignalScheduler;
pub use traces::{aggregate, TraceAggregator, TraceInspector, TraceRecorder};
