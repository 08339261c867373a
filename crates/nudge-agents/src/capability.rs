//! Capability interfaces: diagnosis, coaching and alert drafting.
//!
//! Capabilities return raw JSON; the engine validates it into typed records
//! (`Diagnosis::from_response`, `NudgeContent::from_response`,
//! `AlertDraft::from_response`). A capability never decides anything on its
//! own.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use coordination::config::ToneConfig;
use coordination::error::{CapabilityKind, EngineError, EngineResult};
use coordination::escalation::NudgeEntry;
use coordination::resilience::RetryPolicy;
use coordination::state::{Diagnosis, Event};

/// Everything the diagnosis capability sees about a stuck user.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisRequest {
    pub user_id: String,
    pub session_id: String,
    pub company_id: String,
    /// Stuck point suggested by the tracker
    pub stuck_point_hint: String,
    /// Human-readable trigger, e.g. `inactive for 180s`
    pub trigger: String,
    pub session_duration_minutes: i64,
    pub last_event: Option<String>,
    /// Baseline path, arrow-joined
    pub baseline_summary: Option<String>,
    /// Most recent events, oldest first
    pub events: Vec<Event>,
}

/// Input for the alert drafting capability.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRequest {
    pub user_id: String,
    pub company_id: String,
    pub diagnosis: Diagnosis,
    pub nudge_count: u32,
    /// Recent ineffective nudges, oldest first
    pub recent_nudges: Vec<NudgeSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NudgeSummary {
    pub nudge_type: String,
    pub content: String,
    pub status: String,
    pub sent_at: DateTime<Utc>,
}

impl From<&NudgeEntry> for NudgeSummary {
    fn from(entry: &NudgeEntry) -> Self {
        Self {
            nudge_type: entry.nudge_type.to_string(),
            content: entry.content.clone(),
            status: entry.status.to_string(),
            sent_at: entry.sent_at,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiagnosisCapability: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest) -> EngineResult<Value>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoachCapability: Send + Sync {
    async fn generate_nudge(&self, diagnosis: &Diagnosis, tone: &ToneConfig) -> EngineResult<Value>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertDrafter: Send + Sync {
    async fn draft_alert(&self, request: &AlertRequest) -> EngineResult<Value>;
}

/// Run a capability call with a per-attempt deadline and bounded backoff.
///
/// Only transient failures (timeout, unavailable) are retried. A malformed
/// payload returns immediately.
pub async fn invoke_with_retry<F, Fut>(
    capability: CapabilityKind,
    policy: &RetryPolicy,
    timeout: Duration,
    mut call: F,
) -> EngineResult<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<Value>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::CapabilityTimeout {
                capability,
                elapsed: timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                attempt += 1;
                let backoff = policy.backoff_duration(attempt);
                warn!(
                    %capability,
                    attempt,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient capability error; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = invoke_with_retry(
            CapabilityKind::Diagnosis,
            &RetryPolicy::default(),
            Duration::from_secs(30),
            move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::unavailable(CapabilityKind::Diagnosis, "503"))
                    } else {
                        Ok(serde_json::json!({"ok": true}))
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = invoke_with_retry(
            CapabilityKind::Coach,
            &RetryPolicy::default(),
            Duration::from_secs(30),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::unavailable(CapabilityKind::Coach, "down")) }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "CAPABILITY_UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_capability_timeout() {
        let err = invoke_with_retry(
            CapabilityKind::Diagnosis,
            &RetryPolicy::none(),
            Duration::from_secs(30),
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::CapabilityTimeout { .. }));
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = invoke_with_retry(
            CapabilityKind::Diagnosis,
            &RetryPolicy::default(),
            Duration::from_secs(30),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::malformed(CapabilityKind::Diagnosis, "not json")) }
            },
        )
        .await
        .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
