use std::path::PathBuf;
use std::time::Duration;

use coordination::resilience::RetryPolicy;

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    /// Base URL including the version prefix, e.g. `https://api.openai.com/v1`
    pub url: String,
    pub api_key: String,
    pub model: String,
}

/// Top-level engine settings.
///
/// Every field has an environment override (`NUDGE_*`). Per-company tone,
/// thresholds and baselines come from the company directory file instead.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub llm: LlmEndpoint,
    pub diagnosis_temperature: f32,
    pub coach_temperature: f32,
    pub alert_temperature: f32,
    /// Deadline for a single capability attempt
    pub capability_timeout: Duration,
    pub retry: RetryPolicy,
    /// Events sent to the diagnosis capability
    pub history_window: usize,
    /// How often the worker sweeps sessions for inactivity
    pub sweep_interval: Duration,
    /// Override the directory's tracker idle threshold
    pub idle_threshold_secs: Option<i64>,
    /// Override the directory's tracker session timeout
    pub session_timeout_secs: Option<i64>,
    /// Slack-compatible webhook for CSM alerts
    pub alert_webhook_url: Option<String>,
    /// Append-only JSONL audit log
    pub audit_log: PathBuf,
    /// Overrides the directory's `dashboard_url`
    pub dashboard_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            llm: LlmEndpoint {
                url: std::env::var("NUDGE_LLM_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
                api_key: std::env::var("NUDGE_LLM_API_KEY")
                    .or_else(|_| std::env::var("OPENAI_API_KEY"))
                    .unwrap_or_default(),
                model: std::env::var("NUDGE_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            },
            diagnosis_temperature: 0.3,
            coach_temperature: 0.7,
            alert_temperature: 0.3,
            capability_timeout: Duration::from_secs(env_positive_u64(
                "NUDGE_CAPABILITY_TIMEOUT_SECS",
                30,
            )),
            retry: RetryPolicy {
                max_retries: env_u64("NUDGE_CAPABILITY_RETRIES", 2) as u32,
                ..RetryPolicy::default()
            },
            history_window: env_u64("NUDGE_HISTORY_WINDOW", 30) as usize,
            sweep_interval: Duration::from_secs(env_positive_u64("NUDGE_SWEEP_INTERVAL_SECS", 15)),
            idle_threshold_secs: env_opt_i64("NUDGE_IDLE_THRESHOLD_SECS"),
            session_timeout_secs: env_opt_i64("NUDGE_SESSION_TIMEOUT_SECS"),
            alert_webhook_url: std::env::var("NUDGE_ALERT_WEBHOOK_URL").ok(),
            audit_log: std::env::var("NUDGE_AUDIT_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".nudge-audit.jsonl")),
            dashboard_url: std::env::var("NUDGE_DASHBOARD_URL").ok(),
        }
    }
}

impl EngineSettings {
    /// Settings from `NUDGE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Whether the endpoint looks usable without a network round trip.
    pub fn has_llm_credentials(&self) -> bool {
        !self.llm.api_key.is_empty() || !self.llm.url.starts_with("https://api.openai.com")
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(name, value = %raw, default, "Ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}

/// Like [`env_u64`] but zero falls back to the default.
fn env_positive_u64(name: &str, default: u64) -> u64 {
    match env_u64(name, default) {
        0 => {
            tracing::warn!(name, default, "Ignoring zero setting");
            default
        }
        v => v,
    }
}

fn env_opt_i64(name: &str) -> Option<i64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            tracing::warn!(name, value = %raw, "Ignoring invalid setting");
            None
        }
    }
}

/// Check whether an OpenAI-compatible endpoint answers `/models`.
pub async fn check_endpoint(url: &str, api_key: Option<&str>) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    let mut request = reqwest::Client::new()
        .get(&models_url)
        .timeout(Duration::from_secs(5));
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.bearer_auth(key);
    }
    match request.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_budget() {
        let settings = EngineSettings::default();
        assert_eq!(settings.retry.initial_backoff_ms, 500);
        assert!(settings.diagnosis_temperature < settings.coach_temperature);
        assert!(settings.history_window > 0);
    }

    #[test]
    fn test_env_u64_falls_back_on_garbage() {
        assert_eq!(env_u64("NUDGE_TEST_UNSET_VARIABLE", 7), 7);
        assert_eq!(env_opt_i64("NUDGE_TEST_UNSET_VARIABLE"), None);
    }

    #[test]
    fn test_zero_interval_falls_back_to_default() {
        std::env::set_var("NUDGE_TEST_ZERO_INTERVAL", "0");
        assert_eq!(env_positive_u64("NUDGE_TEST_ZERO_INTERVAL", 15), 15);
        assert_eq!(env_u64("NUDGE_TEST_ZERO_INTERVAL", 15), 0);

        std::env::set_var("NUDGE_TEST_NONZERO_INTERVAL", "3");
        assert_eq!(env_positive_u64("NUDGE_TEST_NONZERO_INTERVAL", 15), 3);
        assert_eq!(env_positive_u64("NUDGE_TEST_UNSET_VARIABLE", 15), 15);
    }

    #[tokio::test]
    async fn test_check_endpoint_unreachable() {
        assert!(!check_endpoint("http://127.0.0.1:1", None).await);
    }
}
