use coach_core::errors::ModelError;
use coach_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The model call failed; transient, the caller may retry the turn.
    #[error("upstream error: {0}")]
    Upstream(#[from] ModelError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("turn aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}
