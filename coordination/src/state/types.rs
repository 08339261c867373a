//! Core types for the nudge engine
//!
//! Events and sessions come from the ingestion boundary, baselines and tone
//! settings from the company directory. Diagnoses, nudges and escalations are
//! write-once records produced by a trigger cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CapabilityKind, EngineError, EngineResult};

/// Unique identifier for a user of the customer's product
pub type UserId = String;

/// Unique identifier for a browsing session
pub type SessionId = String;

/// Unique identifier for a customer company
pub type CompanyId = String;

/// Unique identifier for a persisted nudge
pub type NudgeId = String;

/// Unique identifier for an escalation
pub type EscalationId = String;

/// Generate a fresh record id
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single behavioral event from the client SDK.
///
/// Immutable once recorded. Ordered by `timestamp` within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Idempotency key; duplicates with the same id are dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub company_id: CompanyId,
    /// e.g. `page_view`, `click`, `help_click`, `create_project`
    pub event_type: String,
    /// DOM element the user interacted with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Convenience constructor used by the feed adapters and tests.
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        company_id: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: None,
            user_id: user_id.into(),
            session_id: session_id.into(),
            company_id: company_id.into(),
            event_type: event_type.into(),
            target_element: None,
            timestamp,
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_element = Some(target.into());
        self
    }

    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// Per-session activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub company_id: CompanyId,
    pub start_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
    pub is_active: bool,
    pub event_count: u64,
}

impl Session {
    pub fn new(event: &Event) -> Self {
        Self {
            session_id: event.session_id.clone(),
            user_id: event.user_id.clone(),
            company_id: event.company_id.clone(),
            start_time: event.timestamp,
            last_seen_time: event.timestamp,
            is_active: true,
            event_count: 0,
        }
    }

    /// Minutes between the first and the latest event
    pub fn duration_minutes(&self) -> i64 {
        (self.last_seen_time - self.start_time).num_minutes()
    }
}

/// One expected step on the success path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineStep {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_id: Option<String>,
    /// Human-readable label used in prompts and alerts
    #[serde(default)]
    pub label: String,
}

impl BaselineStep {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            target_element_id: None,
            label: String::new(),
        }
    }

    /// Label if set, otherwise the event type
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.event_type
        } else {
            &self.label
        }
    }
}

/// Expected event sequence for a successful onboarding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub company_id: CompanyId,
    #[serde(default = "default_baseline_name")]
    pub name: String,
    pub event_sequence: Vec<BaselineStep>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_baseline_name() -> String {
    "Default Baseline".to_string()
}

fn default_true() -> bool {
    true
}

impl Baseline {
    /// Build an active baseline from bare event types.
    pub fn from_event_types<I, S>(company_id: impl Into<String>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            company_id: company_id.into(),
            name: default_baseline_name(),
            event_sequence: event_types.into_iter().map(BaselineStep::new).collect(),
            is_active: true,
        }
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.event_sequence.iter().map(|s| s.event_type.as_str())
    }

    /// Arrow-joined step names, e.g. `signup → create_project`
    pub fn summary(&self) -> String {
        self.event_sequence
            .iter()
            .map(BaselineStep::display_name)
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// Structured diagnosis of where and why a user is stuck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub diagnosis_id: String,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub stuck_point: String,
    pub inferred_reason: String,
    /// Always within `[0, 1]`
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Raw shape returned by a diagnosis capability, before validation
#[derive(Debug, Clone, Deserialize)]
struct DiagnosisResponse {
    stuck_point: Option<String>,
    inferred_reason: Option<String>,
    confidence_score: Option<serde_json::Value>,
}

impl Diagnosis {
    /// Validate a capability response into a diagnosis.
    ///
    /// Any missing field, empty string, non-numeric confidence or confidence
    /// outside `[0, 1]` is a malformed response.
    pub fn from_response(
        value: serde_json::Value,
        user_id: &str,
        session_id: &str,
    ) -> EngineResult<Self> {
        let malformed = |msg: String| EngineError::malformed(CapabilityKind::Diagnosis, msg);

        let raw: DiagnosisResponse =
            serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

        let stuck_point = non_empty(raw.stuck_point, "stuck_point").map_err(malformed)?;
        let inferred_reason =
            non_empty(raw.inferred_reason, "inferred_reason").map_err(malformed)?;
        let confidence_score = raw
            .confidence_score
            .as_ref()
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| malformed("confidence_score must be a number".to_string()))?;
        if !(0.0..=1.0).contains(&confidence_score) {
            return Err(malformed(format!(
                "confidence_score {} outside [0, 1]",
                confidence_score
            )));
        }

        Ok(Self {
            diagnosis_id: new_record_id(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            stuck_point,
            inferred_reason,
            confidence_score,
            created_at: Utc::now(),
        })
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(format!("{} is empty", field)),
        None => Err(format!("missing field {}", field)),
    }
}

/// How a nudge is rendered on the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeType {
    /// Attached to the confusing UI element
    Tooltip,
    /// General workflow guidance in the in-app chat
    InAppChat,
    /// Follow-up for users who have been away for a while
    EmailDraft,
}

impl std::fmt::Display for NudgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tooltip => write!(f, "tooltip"),
            Self::InAppChat => write!(f, "in_app_chat"),
            Self::EmailDraft => write!(f, "email_draft"),
        }
    }
}

/// Generated nudge content, validated from a coach capability response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NudgeContent {
    pub nudge_type: NudgeType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_id: Option<String>,
}

impl NudgeContent {
    /// Validate a coach capability response.
    pub fn from_response(value: serde_json::Value) -> EngineResult<Self> {
        let content: NudgeContent = serde_json::from_value(value)
            .map_err(|e| EngineError::malformed(CapabilityKind::Coach, e.to_string()))?;
        if content.content.trim().is_empty() {
            return Err(EngineError::malformed(
                CapabilityKind::Coach,
                "content is empty",
            ));
        }
        Ok(content)
    }
}

/// Delivery lifecycle of a nudge, driven by client acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeStatus {
    Sent,
    Delivered,
    Clicked,
    Dismissed,
}

impl NudgeStatus {
    /// `sent → delivered → clicked|dismissed`; the delivered ack may be skipped.
    pub fn can_transition_to(self, next: NudgeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Sent, Self::Delivered)
                | (Self::Sent, Self::Clicked)
                | (Self::Sent, Self::Dismissed)
                | (Self::Delivered, Self::Clicked)
                | (Self::Delivered, Self::Dismissed)
        )
    }

    /// No acknowledgment can follow.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Clicked | Self::Dismissed)
    }
}

impl std::fmt::Display for NudgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Clicked => write!(f, "clicked"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// A persisted intervention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nudge {
    pub nudge_id: NudgeId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub company_id: CompanyId,
    pub stuck_point: String,
    pub nudge_type: NudgeType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_id: Option<String>,
    pub diagnosis: Diagnosis,
    pub sent_at: DateTime<Utc>,
    pub status: NudgeStatus,
}

impl Nudge {
    pub fn new(company_id: &str, diagnosis: Diagnosis, content: NudgeContent) -> Self {
        Self {
            nudge_id: new_record_id(),
            user_id: diagnosis.user_id.clone(),
            session_id: diagnosis.session_id.clone(),
            company_id: company_id.to_string(),
            stuck_point: diagnosis.stuck_point.clone(),
            nudge_type: content.nudge_type,
            content: content.content,
            target_element_id: content.target_element_id,
            diagnosis,
            sent_at: Utc::now(),
            status: NudgeStatus::Sent,
        }
    }
}

/// CSM-facing lifecycle of an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    InProgress,
    Resolved,
    Dismissed,
}

impl EscalationStatus {
    /// Open and in-progress escalations block new ones for the same key.
    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }

    pub fn can_transition_to(self, next: EscalationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::InProgress)
                | (Self::Open, Self::Resolved)
                | (Self::Open, Self::Dismissed)
                | (Self::InProgress, Self::Resolved)
                | (Self::InProgress, Self::Dismissed)
        )
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Urgency of a CSM alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    High,
    Medium,
    Low,
}

/// CSM-facing alert text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub subject: String,
    pub body: String,
    pub priority: AlertPriority,
}

impl AlertDraft {
    /// Validate an alert drafting capability response.
    pub fn from_response(value: serde_json::Value) -> EngineResult<Self> {
        let draft: AlertDraft = serde_json::from_value(value)
            .map_err(|e| EngineError::malformed(CapabilityKind::AlertDrafting, e.to_string()))?;
        if draft.subject.trim().is_empty() || draft.body.trim().is_empty() {
            return Err(EngineError::malformed(
                CapabilityKind::AlertDrafting,
                "subject and body must be non-empty",
            ));
        }
        Ok(draft)
    }

    /// Deterministic draft used when the drafting capability fails.
    pub fn fallback(user_id: &str, stuck_point: &str, reason: &str, nudge_count: u32) -> Self {
        Self {
            subject: format!("Alert: User needs help with {}", stuck_point),
            body: format!(
                "User {} is stuck at '{}' after {} automated nudges. Inferred reason: {}. \
                 Recommended action: reach out directly.",
                user_id, stuck_point, nudge_count, reason
            ),
            priority: AlertPriority::High,
        }
    }
}

/// Human escalation raised after repeated ineffective nudges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub escalation_id: EscalationId,
    pub user_id: UserId,
    pub company_id: CompanyId,
    pub stuck_point: String,
    pub inferred_reason: String,
    /// Prior nudges for this key, oldest first
    pub nudge_log: Vec<NudgeId>,
    pub nudge_count: u32,
    pub status: EscalationStatus,
    pub deep_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertDraft>,
    pub created_at: DateTime<Utc>,
}

/// Key of a nudge counter and of the escalation idempotence window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
    pub user_id: UserId,
    pub stuck_point: String,
}

impl CounterKey {
    pub fn new(user_id: impl Into<String>, stuck_point: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            stuck_point: stuck_point.into(),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nudge_count:{}:{}", self.user_id, self.stuck_point)
    }
}
