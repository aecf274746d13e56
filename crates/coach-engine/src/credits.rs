use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use coach_core::credits::{ConsumeReason, ConsumeResult, CreditStatus, Feature};
use coach_core::ids::UserId;
use coach_store::{CreditsRpc, StoreError};

/// Transport failure of the credit service. Running out of credits is not an
/// error; it comes back as a [`ConsumeResult`].
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("credit service unavailable: {0}")]
    Unavailable(#[source] StoreError),

    #[error("credit account not found for {0}")]
    NoAccount(UserId),
}

impl From<StoreError> for CreditError {
    fn from(e: StoreError) -> Self {
        CreditError::Unavailable(e)
    }
}

/// How a feature behaves when the credit service cannot answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    /// Allow and meter later.
    Soft,
    /// Deny until credits can be verified.
    Hard,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted(ConsumeResult),
    Denied(ConsumeResult),
    /// The service could not be reached; the gate decides.
    Unverified(Gate),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        match self {
            Self::Granted(_) | Self::Unverified(Gate::Soft) => true,
            Self::Denied(_) | Self::Unverified(Gate::Hard) => false,
        }
    }
}

#[derive(Debug, Default)]
struct CachedStatus {
    status: Option<CreditStatus>,
    stale: bool,
    /// Bumped whenever a response updates `status`.
    version: u64,
}

/// Per-user view of the credit service.
///
/// The service is the source of truth. The local copy is replaced only from
/// successful responses; a failed call marks it stale and leaves the value.
/// A `status()` read that overlaps a `check`/`consume` never replaces the
/// balance that call reported. The first metered call on an empty copy
/// fetches the full status.
pub struct CreditMeter {
    rpc: Arc<dyn CreditsRpc>,
    user_id: UserId,
    cached: Mutex<CachedStatus>,
}

impl CreditMeter {
    pub fn new(rpc: Arc<dyn CreditsRpc>, user_id: UserId) -> Self {
        Self {
            rpc,
            user_id,
            cached: Mutex::new(CachedStatus::default()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Fetch the account from the service and refresh the local copy.
    pub async fn status(&self) -> Result<CreditStatus, CreditError> {
        let seen = self.cached.lock().version;
        match self.rpc.get_status(&self.user_id).await {
            Ok(status) => Ok(self.install(status, seen)),
            Err(StoreError::NotFound(_)) => Err(CreditError::NoAccount(self.user_id.clone())),
            Err(e) => {
                self.mark_stale();
                Err(e.into())
            }
        }
    }

    /// Last known status and whether it is stale.
    pub fn cached(&self) -> Option<(CreditStatus, bool)> {
        let cached = self.cached.lock();
        cached.status.clone().map(|s| (s, cached.stale))
    }

    /// Whether `feature` is affordable right now. Never deducts.
    pub async fn check(&self, feature: Feature) -> Result<ConsumeResult, CreditError> {
        self.call(feature, false).await
    }

    /// Atomically check and deduct at the service.
    pub async fn consume(&self, feature: Feature) -> Result<ConsumeResult, CreditError> {
        let result = self.call(feature, true).await?;
        if result.success {
            debug!(user_id = %self.user_id, feature = %feature, cost = result.cost, remaining = result.credits_remaining, "credits consumed");
        }
        Ok(result)
    }

    /// Check `feature`, resolving an unreachable service through `gate`.
    pub async fn allows(&self, feature: Feature, gate: Gate) -> Admission {
        match self.check(feature).await {
            Ok(result) if result.success => Admission::Granted(result),
            Ok(result) => Admission::Denied(result),
            Err(e) => {
                warn!(user_id = %self.user_id, feature = %feature, ?gate, error = %e, "credit check failed");
                Admission::Unverified(gate)
            }
        }
    }

    async fn call(&self, feature: Feature, deduct: bool) -> Result<ConsumeResult, CreditError> {
        match self.rpc.consume_for_feature(&self.user_id, feature, deduct).await {
            Ok(result) => {
                if self.apply(&result) {
                    if let Err(e) = self.status().await {
                        debug!(user_id = %self.user_id, error = %e, "credit status resync failed");
                    }
                }
                Ok(result)
            }
            Err(e) => {
                self.mark_stale();
                Err(e.into())
            }
        }
    }

    fn install(&self, status: CreditStatus, seen: u64) -> CreditStatus {
        let mut guard = self.cached.lock();
        let cached = &mut *guard;
        if cached.version != seen {
            if let Some(newer) = &cached.status {
                cached.stale = false;
                return newer.clone();
            }
        }
        cached.status = Some(status.clone());
        cached.stale = false;
        cached.version += 1;
        status
    }

    /// Fold a metered response into the local copy. Returns true when there
    /// is no local copy yet and the full status should be fetched.
    fn apply(&self, result: &ConsumeResult) -> bool {
        if result.reason == Some(ConsumeReason::NoAccount) {
            return false;
        }
        let mut cached = self.cached.lock();
        match cached.status.as_mut() {
            Some(status) => {
                status.remaining = result.credits_remaining;
                cached.version += 1;
                false
            }
            None => true,
        }
    }

    fn mark_stale(&self) {
        self.cached.lock().stale = true;
    }
}
