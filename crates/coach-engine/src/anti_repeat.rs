//! Near-duplicate reply detection.
//!
//! Candidate and history entries are normalized (lowercase, punctuation
//! stripped, whitespace collapsed) and compared as word sets with Jaccard
//! similarity. Only the last `window` history entries are consulted.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use coach_core::settings::AntiRepeatSettings;

static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Generic prompts used when the caller has no usable fallback.
const GENERIC_PROMPTS: &[&str] = &[
    "How are you feeling about that?",
    "What would you like to focus on next?",
    "Tell me a bit more about how today went.",
    "Is there anything getting in the way right now?",
    "What's one small step you could take today?",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Sent as produced by the model.
    Model,
    /// Substituted because the model reply repeated an earlier one.
    Alternative,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyHistoryEntry {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ReplyKind,
}

/// Accepted replies, oldest first, bounded to `capacity`.
#[derive(Clone, Debug)]
pub struct ReplyHistory {
    entries: Vec<ReplyHistoryEntry>,
    capacity: usize,
}

impl ReplyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, text: impl Into<String>, kind: ReplyKind) {
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(ReplyHistoryEntry {
            text: text.into(),
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn entries(&self) -> &[ReplyHistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn normalize(text: &str) -> String {
    let lower = text.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lower, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// Jaccard similarity of the word sets of two normalized strings.
/// Two empty sets count as identical.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a: HashSet<&str> = a.split_whitespace().collect();
    let b: HashSet<&str> = b.split_whitespace().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

pub struct AntiRepeatGuard {
    settings: AntiRepeatSettings,
    pool: Vec<String>,
    rng: Mutex<StdRng>,
}

impl AntiRepeatGuard {
    pub fn new(settings: AntiRepeatSettings) -> Self {
        Self {
            settings,
            pool: GENERIC_PROMPTS.iter().map(|s| (*s).to_string()).collect(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic pool picks for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_pool(mut self, pool: Vec<String>) -> Self {
        self.pool = pool;
        self
    }

    pub fn is_redundant(&self, candidate: &str, history: &[ReplyHistoryEntry]) -> bool {
        self.is_redundant_with(candidate, history, jaccard)
    }

    /// Like [`is_redundant`](Self::is_redundant) with a caller-supplied
    /// similarity over normalized strings.
    pub fn is_redundant_with<F>(&self, candidate: &str, history: &[ReplyHistoryEntry], similarity: F) -> bool
    where
        F: Fn(&str, &str) -> f64,
    {
        let start = history.len().saturating_sub(self.settings.window);
        let normalized = normalize(candidate);
        history[start..].iter().any(|entry| {
            let score = similarity(&normalized, &normalize(&entry.text));
            if score >= self.settings.similarity_threshold {
                debug!(score, threshold = self.settings.similarity_threshold, "reply repeats recent history");
                true
            } else {
                false
            }
        })
    }

    /// A replacement for a redundant candidate: the first fallback that
    /// differs from it, else a random generic prompt, else the candidate's
    /// first sentence.
    pub fn generate_alternative(&self, candidate: &str, fallbacks: &[String]) -> String {
        let normalized = normalize(candidate);
        if let Some(f) = fallbacks
            .iter()
            .find(|f| !f.trim().is_empty() && normalize(f) != normalized)
        {
            return f.clone();
        }

        let usable: Vec<&String> = self
            .pool
            .iter()
            .filter(|p| normalize(p) != normalized)
            .collect();
        if let Some(pick) = usable.choose(&mut *self.rng.lock()) {
            return (*pick).clone();
        }

        first_sentence(candidate)
    }
}

fn first_sentence(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.find(['.', '!', '?']) {
        Some(end) => trimmed[..=end].to_string(),
        None => trimmed.to_string(),
    }
}
