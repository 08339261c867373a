//! Coach agent: diagnosis and tone in, nudge content out.

use async_trait::async_trait;
use serde_json::Value;

use coordination::config::ToneConfig;
use coordination::error::{CapabilityKind, EngineResult};
use coordination::state::Diagnosis;

use super::ChatClient;
use crate::capability::CoachCapability;
use crate::prompts;

pub struct LlmCoach {
    client: ChatClient,
    temperature: f32,
    system_prompt: String,
}

impl LlmCoach {
    pub fn new(client: ChatClient, temperature: f32) -> Self {
        Self {
            client,
            temperature,
            system_prompt: prompts::coach_system_prompt(),
        }
    }
}

#[async_trait]
impl CoachCapability for LlmCoach {
    async fn generate_nudge(&self, diagnosis: &Diagnosis, tone: &ToneConfig) -> EngineResult<Value> {
        self.client
            .complete_json(
                CapabilityKind::Coach,
                &self.system_prompt,
                &prompts::coach_prompt(diagnosis, tone),
                self.temperature,
            )
            .await
    }
}
