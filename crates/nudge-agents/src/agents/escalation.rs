//! Alert drafting agent for CSM escalations.

use async_trait::async_trait;
use serde_json::Value;

use coordination::error::{CapabilityKind, EngineResult};

use super::ChatClient;
use crate::capability::{AlertDrafter, AlertRequest};
use crate::prompts;

pub struct LlmAlertDrafter {
    client: ChatClient,
    temperature: f32,
    system_prompt: String,
}

impl LlmAlertDrafter {
    pub fn new(client: ChatClient, temperature: f32) -> Self {
        Self {
            client,
            temperature,
            system_prompt: prompts::alert_system_prompt(),
        }
    }
}

#[async_trait]
impl AlertDrafter for LlmAlertDrafter {
    async fn draft_alert(&self, request: &AlertRequest) -> EngineResult<Value> {
        self.client
            .complete_json(
                CapabilityKind::AlertDrafting,
                &self.system_prompt,
                &prompts::alert_prompt(request),
                self.temperature,
            )
            .await
    }
}
