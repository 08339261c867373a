//! Diagnosis agent: event stream in, `{stuck_point, inferred_reason,
//! confidence_score}` out.

use async_trait::async_trait;
use serde_json::Value;

use coordination::error::{CapabilityKind, EngineResult};

use super::ChatClient;
use crate::capability::{DiagnosisCapability, DiagnosisRequest};
use crate::prompts;

pub struct LlmDiagnosis {
    client: ChatClient,
    temperature: f32,
    system_prompt: String,
}

impl LlmDiagnosis {
    pub fn new(client: ChatClient, temperature: f32) -> Self {
        Self {
            client,
            temperature,
            system_prompt: prompts::diagnosis_system_prompt(),
        }
    }
}

#[async_trait]
impl DiagnosisCapability for LlmDiagnosis {
    async fn diagnose(&self, request: &DiagnosisRequest) -> EngineResult<Value> {
        self.client
            .complete_json(
                CapabilityKind::Diagnosis,
                &self.system_prompt,
                &prompts::diagnosis_prompt(request),
                self.temperature,
            )
            .await
    }
}
