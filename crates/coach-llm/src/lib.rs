pub mod guarded;
pub mod mock;
pub mod resilience;

pub use guarded::GuardedModel;
pub use mock::{MockModel, MockReply};
pub use resilience::{CircuitSnapshot, ResilienceGuard};
