//! Coordination core for the onboarding nudge engine
//!
//! Everything in this crate is deterministic and free of network calls:
//!
//! - `tracker`: per-session event windows and trigger detection
//! - `baseline`: deviation of observed behavior from the success path
//! - `router`: confidence gate in front of nudge generation
//! - `escalation`: nudge counters, the cycle state machine and the
//!   escalation registry
//! - `events`: broadcast bus for live observers
//! - `resilience`: retry budgets and capability health
//! - `config`: the company directory (tone, thresholds, baselines)
//!
//! Capability calls (diagnosis, coaching, alert drafting) and delivery live
//! in the `nudge-agents` crate, which drives these pieces per trigger.
//!
//! # Cycle
//!
//! ```text
//! event ─▶ tracker ─▶ trigger ─▶ diagnose ─▶ router ─┬─ abort
//!                                                    └─ coach ─▶ counter ─┬─ dispatch
//!                                                                         └─ escalate + dispatch
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod baseline;
pub mod config;
pub mod error;
pub mod escalation;
pub mod events;
pub mod resilience;
pub mod router;
pub mod state;
pub mod tracker;

pub use baseline::{deviation, DeviationSummary, Divergence};
pub use config::{CompanyConfig, CompanyDirectory, ToneConfig};
pub use error::{CapabilityKind, EngineError, EngineResult};
pub use escalation::{
    AbortReason, CycleOutcome, CyclePhase, CycleReport, CycleState, EscalationGate, StatusChange,
};
pub use events::{EngineEvent, EventBus, EventFilter, SessionEndReason, SharedEventBus};
pub use resilience::{CapabilityHealth, HealthLevel, RetryPolicy};
pub use router::{route, Route, DEFAULT_CONFIDENCE_THRESHOLD};
pub use state::{
    AlertDraft, AlertPriority, Baseline, BaselineStep, CounterKey, CounterStore, Diagnosis,
    Escalation, EscalationStatus, Event, InMemoryCounterStore, Nudge, NudgeContent, NudgeStatus,
    NudgeType, Session, SharedCounterStore,
};
pub use tracker::{
    Observation, SessionSnapshot, SessionTracker, StuckSignature, SweepReport, TrackerConfig,
    TriggerKind, TriggerSignal,
};
