//! LLM-backed capabilities for the nudge engine.
//!
//! Each capability is a thin wrapper over a shared [`ChatClient`] that talks
//! to an OpenAI-compatible `/chat/completions` endpoint in JSON mode. The
//! [`CapabilitySet`] ties them together from `EngineSettings`.

pub mod coach;
pub mod diagnosis;
pub mod escalation;

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use coordination::error::{CapabilityKind, EngineError, EngineResult};

use crate::capability::{AlertDrafter, CoachCapability, DiagnosisCapability};
use crate::config::{EngineSettings, LlmEndpoint};

pub use coach::LlmCoach;
pub use diagnosis::LlmDiagnosis;
pub use escalation::LlmAlertDrafter;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").unwrap());

/// Minimal client for OpenAI-compatible chat completions.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: LlmEndpoint,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatClient {
    pub fn new(endpoint: LlmEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for LLM endpoint")?;
        Ok(Self { http, endpoint })
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    /// Run one JSON-mode completion and return the parsed object.
    ///
    /// Transport errors and non-success statuses are `CapabilityUnavailable`;
    /// a reply that is not a JSON object is `CapabilityMalformedResponse`.
    pub async fn complete_json(
        &self,
        capability: CapabilityKind,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> EngineResult<Value> {
        let url = format!(
            "{}/chat/completions",
            self.endpoint.url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.endpoint.model,
            "temperature": temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut request = self.http.post(&url).json(&body);
        if !self.endpoint.api_key.is_empty() {
            request = request.bearer_auth(&self.endpoint.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::unavailable(capability, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::unavailable(
                capability,
                format!("HTTP {}: {}", status, truncate(&text, 200)),
            ));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::malformed(capability, e.to_string()))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::malformed(capability, "empty completion"))?;

        debug!(%capability, model = %self.endpoint.model, chars = content.len(), "Completion received");
        parse_json_object(capability, &content)
    }
}

/// Parse model output into a JSON object, tolerating a markdown code fence.
pub fn parse_json_object(capability: CapabilityKind, raw: &str) -> EngineResult<Value> {
    let text = CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map_or(raw.trim(), |m| m.as_str());
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::malformed(capability, format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(EngineError::malformed(
            capability,
            "expected a JSON object",
        ));
    }
    Ok(value)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// All capabilities the engine needs, built from one endpoint.
#[derive(Clone)]
pub struct CapabilitySet {
    pub diagnosis: Arc<dyn DiagnosisCapability>,
    pub coach: Arc<dyn CoachCapability>,
    pub alerts: Arc<dyn AlertDrafter>,
}

impl CapabilitySet {
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let client = ChatClient::new(settings.llm.clone())
            .with_context(|| format!("Invalid LLM endpoint {}", settings.llm.url))?;
        Ok(Self {
            diagnosis: Arc::new(LlmDiagnosis::new(
                client.clone(),
                settings.diagnosis_temperature,
            )),
            coach: Arc::new(LlmCoach::new(client.clone(), settings.coach_temperature)),
            alerts: Arc::new(LlmAlertDrafter::new(client, settings.alert_temperature)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_object() {
        let v = parse_json_object(CapabilityKind::Diagnosis, r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_parse_fenced_object() {
        let raw = "```json\n{\"stuck_point\": \"invite_team\"}\n```";
        let v = parse_json_object(CapabilityKind::Diagnosis, raw).unwrap();
        assert_eq!(v["stuck_point"], "invite_team");
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        let err = parse_json_object(CapabilityKind::Coach, "[1, 2]").unwrap_err();
        assert_eq!(err.code(), "CAPABILITY_MALFORMED_RESPONSE");
        assert!(parse_json_object(CapabilityKind::Coach, "sure, here you go").is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let client = ChatClient::new(LlmEndpoint {
            url: "http://127.0.0.1:1/v1".into(),
            api_key: String::new(),
            model: "test".into(),
        })
        .unwrap();
        let err = client
            .complete_json(CapabilityKind::Diagnosis, "sys", "user", 0.3)
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
