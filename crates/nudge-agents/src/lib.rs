//! Async side of the onboarding nudge engine
//!
//! Wraps the deterministic `coordination` core with the pieces that talk to
//! the outside world: LLM capabilities, live delivery, CSM alerts, the audit
//! trail and the event feed. [`orchestrator::NudgeEngine`] ties them together.

pub mod agents;
pub mod capability;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod feed;
pub mod orchestrator;
pub mod prompts;
pub mod sink;

pub use agents::CapabilitySet;
pub use capability::{AlertDrafter, CoachCapability, DiagnosisCapability};
pub use config::EngineSettings;
pub use directory::{BaselineStore, ConfigStore, DirectoryStore};
pub use dispatcher::{
    AlertChannel, ConnectionRegistry, DeliveryChannel, DispatchReport, Dispatcher,
    LogAlertChannel, LogDeliveryChannel, NudgePayload, WebhookAlertChannel,
};
pub use orchestrator::{EngineOptions, EngineParts, NudgeEngine};
pub use sink::{AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink};
