//! Resilience: retry budgets and capability health
//!
//! Capability calls are wrapped with a per-attempt timeout and a bounded
//! exponential backoff. Health tracking records how each capability behaves
//! across cycles so a degrading backend shows up in the logs before every
//! cycle starts aborting.
//!
//! ```text
//! attempt 0 ──fail──▶ sleep 500ms ─▶ attempt 1 ──fail──▶ sleep 1s ─▶ attempt 2 ──fail──▶ abort cycle
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CapabilityKind;

/// Retry budget for transient capability failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff delay before the given attempt (0-indexed; attempt 0 never waits).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another retry is allowed after `attempt` retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    /// Total attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    /// Default: 2 retries, 500ms initial backoff, 2x multiplier, 5s max.
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

/// Observed state of a capability backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    /// Recent failures, still answering some calls
    Degraded,
    /// Three or more consecutive failures
    Unavailable,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Health tracking for one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityHealth {
    pub capability: CapabilityKind,
    pub level: HealthLevel,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    /// When `level` last changed
    pub last_change: DateTime<Utc>,
}

impl CapabilityHealth {
    pub fn new(capability: CapabilityKind) -> Self {
        Self {
            capability,
            level: HealthLevel::Healthy,
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_calls: 0,
            total_failures: 0,
            last_error: None,
            last_change: Utc::now(),
        }
    }

    /// Record a successful call. Returns the new level if it changed.
    pub fn record_success(&mut self) -> Option<HealthLevel> {
        self.total_calls += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;

        // three clean calls in a row before trusting the backend again
        if self.level != HealthLevel::Healthy && self.consecutive_successes >= 3 {
            self.last_error = None;
            return self.set_level(HealthLevel::Healthy);
        }
        None
    }

    /// Record a failed call. Returns the new level if it changed.
    pub fn record_failure(&mut self, error: &str) -> Option<HealthLevel> {
        self.total_calls += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_error = Some(error.to_string());

        let level = if self.consecutive_failures >= 3 {
            HealthLevel::Unavailable
        } else {
            HealthLevel::Degraded
        };
        self.set_level(level)
    }

    fn set_level(&mut self, level: HealthLevel) -> Option<HealthLevel> {
        if level == self.level {
            return None;
        }
        self.level = level;
        self.last_change = Utc::now();
        Some(level)
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_ms(0), 0);
        assert_eq!(p.backoff_ms(1), 500);
        assert_eq!(p.backoff_ms(2), 1_000);
        assert_eq!(p.backoff_ms(10), 5_000);
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
        assert_eq!(p.max_attempts(), 3);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }

    #[test]
    fn test_partial_policy_from_toml_keeps_defaults() {
        let p: RetryPolicy = serde_json::from_str(r#"{"max_retries": 4}"#).unwrap();
        assert_eq!(p.max_retries, 4);
        assert_eq!(p.initial_backoff_ms, 500);
    }

    #[test]
    fn test_health_degrades_and_recovers() {
        let mut h = CapabilityHealth::new(CapabilityKind::Diagnosis);
        assert_eq!(h.record_failure("timeout"), Some(HealthLevel::Degraded));
        assert_eq!(h.record_failure("timeout"), None);
        assert_eq!(h.record_failure("timeout"), Some(HealthLevel::Unavailable));
        assert_eq!(h.consecutive_failures, 3);

        assert_eq!(h.record_success(), None);
        assert_eq!(h.record_success(), None);
        assert_eq!(h.record_success(), Some(HealthLevel::Healthy));
        assert!(h.last_error.is_none());
        assert_eq!(h.failure_rate(), 0.5);
    }
}
