//! Layered configuration for the orchestration core.
//!
//! Loading flow:
//! 1. Start with compiled [`CoachSettings::default()`]
//! 2. If `~/.coach/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `COACH_*` environment variable overrides
//! 4. [`CoachSettings::validate`] rejects anything the components cannot run with
//!
//! A settings error is fatal at startup; nothing re-reads settings per request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::SettingsError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoachSettings {
    pub resilience: ResilienceSettings,
    pub anti_repeat: AntiRepeatSettings,
    pub memory: MemorySettings,
    pub traces: TraceSettings,
    pub shadow: ShadowSettings,
    pub credits: CreditSettings,
    pub storage: StorageSettings,
}

/// Circuit breaker, token bucket and concurrency limits for outbound calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Backoff at exactly `failure_threshold` failures.
    pub recovery_timeout_ms: u64,
    /// Upper bound on the computed backoff.
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Token bucket capacity.
    pub rate_capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    pub max_concurrent: usize,
    /// How often a caller waiting for a concurrency slot re-checks.
    pub concurrency_poll_ms: u64,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            max_backoff_ms: 300_000,
            backoff_multiplier: 2.0,
            rate_capacity: 50.0,
            refill_per_sec: 10.0,
            max_concurrent: 3,
            concurrency_poll_ms: 100,
        }
    }
}

impl ResilienceSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn concurrency_poll(&self) -> Duration {
        Duration::from_millis(self.concurrency_poll_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AntiRepeatSettings {
    /// How many recent replies a candidate is compared against.
    pub window: usize,
    /// Jaccard similarity at or above which a reply counts as a repeat.
    pub similarity_threshold: f64,
}

impl Default for AntiRepeatSettings {
    fn default() -> Self {
        Self {
            window: 8,
            similarity_threshold: 0.75,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySettings {
    /// Most recent messages that are never folded into the summary.
    pub recent_window: usize,
    /// Unsummarized window length above which compression is requested.
    pub compression_threshold: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            recent_window: 10,
            compression_threshold: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceSettings {
    /// Latency at or above which a trace is flagged degraded.
    pub sla_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            sla_ms: 2000,
            poll_interval_ms: 1500,
            max_poll_attempts: 20,
        }
    }
}

impl TraceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShadowSettings {
    pub chip_delay_ms: u64,
    /// Lifetime of a stored suggestion set.
    pub suggestion_ttl_ms: u64,
    pub max_suggestions: usize,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            chip_delay_ms: 6500,
            suggestion_ttl_ms: 120_000,
            max_suggestions: 3,
        }
    }
}

impl ShadowSettings {
    pub fn chip_delay(&self) -> Duration {
        Duration::from_millis(self.chip_delay_ms)
    }

    pub fn suggestion_ttl(&self) -> Duration {
        Duration::from_millis(self.suggestion_ttl_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreditSettings {
    /// Quota given to accounts created by the bundled store.
    pub default_monthly_quota: u32,
}

impl Default for CreditSettings {
    fn default() -> Self {
        Self {
            default_monthly_quota: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: coach_dir().join("database").join("coach.db"),
        }
    }
}

impl CoachSettings {
    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let r = &self.resilience;
        ensure(r.failure_threshold >= 1, "resilience.failureThreshold", "must be at least 1")?;
        ensure(r.recovery_timeout_ms > 0, "resilience.recoveryTimeoutMs", "must be positive")?;
        ensure(
            r.max_backoff_ms >= r.recovery_timeout_ms,
            "resilience.maxBackoffMs",
            "must not be below recoveryTimeoutMs",
        )?;
        ensure(r.backoff_multiplier >= 1.0, "resilience.backoffMultiplier", "must be >= 1.0")?;
        ensure(r.rate_capacity >= 1.0, "resilience.rateCapacity", "must be at least 1")?;
        ensure(r.refill_per_sec > 0.0, "resilience.refillPerSec", "must be positive")?;
        ensure(r.max_concurrent >= 1, "resilience.maxConcurrent", "must be at least 1")?;
        ensure(r.concurrency_poll_ms > 0, "resilience.concurrencyPollMs", "must be positive")?;

        let a = &self.anti_repeat;
        ensure(a.window >= 1, "antiRepeat.window", "must be at least 1")?;
        ensure(
            a.similarity_threshold > 0.0 && a.similarity_threshold <= 1.0,
            "antiRepeat.similarityThreshold",
            "must be in (0, 1]",
        )?;

        let m = &self.memory;
        ensure(m.recent_window >= 1, "memory.recentWindow", "must be at least 1")?;
        ensure(
            m.compression_threshold > m.recent_window,
            "memory.compressionThreshold",
            "must exceed recentWindow",
        )?;

        let t = &self.traces;
        ensure(t.sla_ms > 0, "traces.slaMs", "must be positive")?;
        ensure(t.max_poll_attempts >= 1, "traces.maxPollAttempts", "must be at least 1")?;

        let s = &self.shadow;
        ensure(s.max_suggestions >= 1, "shadow.maxSuggestions", "must be at least 1")?;
        ensure(s.suggestion_ttl_ms > 0, "shadow.suggestionTtlMs", "must be positive")?;
        Ok(())
    }
}

fn ensure(ok: bool, field: &'static str, reason: &str) -> Result<(), SettingsError> {
    if ok {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            field,
            reason: reason.to_string(),
        })
    }
}

/// Resolve the path to the settings file (`~/.coach/settings.json`).
pub fn settings_path() -> PathBuf {
    coach_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides, validated.
pub fn load_settings() -> Result<CoachSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides, validated.
///
/// A missing file yields defaults. Invalid JSON or an invalid value is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CoachSettings, SettingsError> {
    let defaults = serde_json::to_value(CoachSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CoachSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge: objects merge per key, everything else is replaced,
/// and nulls in `source` keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COACH_*` environment overrides. Unparseable values are logged and ignored.
pub fn apply_env_overrides(settings: &mut CoachSettings) {
    let r = &mut settings.resilience;
    if let Some(v) = read_env::<u32>("COACH_FAILURE_THRESHOLD") {
        r.failure_threshold = v;
    }
    if let Some(v) = read_env::<u64>("COACH_RECOVERY_TIMEOUT_MS") {
        r.recovery_timeout_ms = v;
    }
    if let Some(v) = read_env::<u64>("COACH_MAX_BACKOFF_MS") {
        r.max_backoff_ms = v;
    }
    if let Some(v) = read_env::<f64>("COACH_BACKOFF_MULTIPLIER") {
        r.backoff_multiplier = v;
    }
    if let Some(v) = read_env::<f64>("COACH_RATE_CAPACITY") {
        r.rate_capacity = v;
    }
    if let Some(v) = read_env::<f64>("COACH_REFILL_PER_SEC") {
        r.refill_per_sec = v;
    }
    if let Some(v) = read_env::<usize>("COACH_MAX_CONCURRENT") {
        r.max_concurrent = v;
    }
    if let Some(v) = read_env::<usize>("COACH_ANTI_REPEAT_WINDOW") {
        settings.anti_repeat.window = v;
    }
    if let Some(v) = read_env::<f64>("COACH_SIMILARITY_THRESHOLD") {
        settings.anti_repeat.similarity_threshold = v;
    }
    if let Some(v) = read_env::<u64>("COACH_SLA_MS") {
        settings.traces.sla_ms = v;
    }
    if let Some(v) = read_env::<u64>("COACH_CHIP_DELAY_MS") {
        settings.shadow.chip_delay_ms = v;
    }
    if let Some(v) = read_env::<u64>("COACH_SUGGESTION_TTL_MS") {
        settings.shadow.suggestion_ttl_ms = v;
    }
    if let Some(v) = std::env::var("COACH_DATABASE").ok().filter(|v| !v.is_empty()) {
        settings.storage.database_path = PathBuf::from(v);
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let parsed = parse_value(&val);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    parsed
}

/// Parse a trimmed env value.
pub fn parse_value<T: std::str::FromStr>(val: &str) -> Option<T> {
    val.trim().parse().ok()
}

fn coach_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".coach")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("coach-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults_are_valid() {
        let settings = CoachSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.resilience.failure_threshold, 5);
        assert_eq!(settings.anti_repeat.window, 8);
        assert!((settings.anti_repeat.similarity_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(settings.traces.sla_ms, 2000);
        assert_eq!(settings.shadow.chip_delay_ms, 6500);
        assert_eq!(settings.shadow.max_suggestions, 3);
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"resilience": {"failureThreshold": 5, "maxConcurrent": 3}});
        let source = serde_json::json!({"resilience": {"maxConcurrent": 8}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["resilience"]["maxConcurrent"], 8);
        assert_eq!(merged["resilience"]["failureThreshold"], 5);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaced() {
        let merged = deep_merge(serde_json::json!({"a": [1, 2]}), serde_json::json!({"a": [3]}));
        assert_eq!(merged["a"], serde_json::json!([3]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("coach-does-not-exist").join("settings.json");
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.memory.recent_window, 10);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = temp_settings(r#"{"traces": {"slaMs": 1500}, "memory": {"recentWindow": 4}}"#);
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.traces.sla_ms, 1500);
        assert_eq!(settings.memory.recent_window, 4);
        assert_eq!(settings.memory.compression_threshold, 20);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_settings("{not json");
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_value_is_fatal() {
        let path = temp_settings(r#"{"resilience": {"failureThreshold": 0}}"#);
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid { field: "resilience.failureThreshold", .. }
        ));
    }

    #[test]
    fn compression_threshold_must_exceed_window() {
        let mut settings = CoachSettings::default();
        settings.memory.compression_threshold = settings.memory.recent_window;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn similarity_threshold_range() {
        let mut settings = CoachSettings::default();
        settings.anti_repeat.similarity_threshold = 1.2;
        assert!(settings.validate().is_err());
        settings.anti_repeat.similarity_threshold = 1.0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parse_value_trims() {
        assert_eq!(parse_value::<u32>(" 7 "), Some(7));
        assert_eq!(parse_value::<f64>("0.5"), Some(0.5));
        assert_eq!(parse_value::<u32>("seven"), None);
    }

    #[test]
    fn durations() {
        let r = ResilienceSettings::default();
        assert_eq!(r.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(r.concurrency_poll(), Duration::from_millis(100));
        assert_eq!(ShadowSettings::default().chip_delay(), Duration::from_millis(6500));
    }
}
