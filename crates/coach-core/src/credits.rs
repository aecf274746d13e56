use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// A metered feature. Costs are owned by the credit store; `default_cost`
/// is what the bundled SQLite store charges.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ChatMessage,
    VoiceMessage,
    PhotoAnalysis,
    PlanGeneration,
}

impl Feature {
    pub fn default_cost(self) -> u32 {
        match self {
            Self::ChatMessage => 1,
            Self::VoiceMessage => 2,
            Self::PhotoAnalysis => 3,
            Self::PlanGeneration => 5,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChatMessage => write!(f, "chat_message"),
            Self::VoiceMessage => write!(f, "voice_message"),
            Self::PhotoAnalysis => write!(f, "photo_analysis"),
            Self::PlanGeneration => write!(f, "plan_generation"),
        }
    }
}

impl std::str::FromStr for Feature {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_message" => Ok(Self::ChatMessage),
            "voice_message" => Ok(Self::VoiceMessage),
            "photo_analysis" => Ok(Self::PhotoAnalysis),
            "plan_generation" => Ok(Self::PlanGeneration),
            other => Err(format!("unknown feature: {other}")),
        }
    }
}

/// Credit account as reported by the credit store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditStatus {
    pub user_id: UserId,
    pub remaining: u32,
    pub monthly_quota: u32,
    /// Month the quota was last reset, formatted `YYYY-MM`.
    pub reset_month: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeReason {
    InsufficientCredits,
    NoAccount,
}

impl std::fmt::Display for ConsumeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientCredits => write!(f, "insufficient_credits"),
            Self::NoAccount => write!(f, "no_account"),
        }
    }
}

/// Shared result of `check` and `consume`. Running out of credits is a
/// normal outcome carried here, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConsumeReason>,
    pub cost: u32,
    pub credits_remaining: u32,
}

impl ConsumeResult {
    pub fn granted(cost: u32, credits_remaining: u32) -> Self {
        Self {
            success: true,
            reason: None,
            cost,
            credits_remaining,
        }
    }

    pub fn denied(reason: ConsumeReason, cost: u32, credits_remaining: u32) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            cost,
            credits_remaining,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.reason == Some(ConsumeReason::InsufficientCredits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_roundtrip() {
        for f in [
            Feature::ChatMessage,
            Feature::VoiceMessage,
            Feature::PhotoAnalysis,
            Feature::PlanGeneration,
        ] {
            let parsed: Feature = f.to_string().parse().unwrap();
            assert_eq!(parsed, f);
        }
    }

    #[test]
    fn denied_result_serializes_reason() {
        let result = ConsumeResult::denied(ConsumeReason::InsufficientCredits, 1, 0);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "insufficient_credits");
        assert!(result.is_insufficient());
    }

    #[test]
    fn granted_result_omits_reason() {
        let json = serde_json::to_value(ConsumeResult::granted(2, 8)).unwrap();
        assert!(json.get("reason").is_none());
        assert_eq!(json["credits_remaining"], 8);
    }
}
