//! Engine event types
//!
//! Published on the event bus for live observers (session monitors, CSM
//! dashboards). They describe what the engine did; they are never read back
//! by the engine itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CapabilityKind;
use crate::escalation::AbortReason;
use crate::resilience::HealthLevel;
use crate::state::{
    EscalationId, EscalationStatus, NudgeId, NudgeStatus, NudgeType, SessionId, UserId,
};
use crate::tracker::TriggerKind;

/// Why a session stopped being active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// No activity for longer than the session timeout
    Timeout,
    /// The user started a newer session
    Superseded,
    /// Closed explicitly by the client
    Closed,
}

/// All events the nudge engine publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        user_id: UserId,
        session_id: SessionId,
        company_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A stuck signal or idle gap started a cycle
    TriggerFired {
        user_id: UserId,
        session_id: SessionId,
        stuck_point: String,
        kind: TriggerKind,
        timestamp: DateTime<Utc>,
    },

    DiagnosisRecorded {
        user_id: UserId,
        session_id: SessionId,
        stuck_point: String,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A cycle ended without a nudge
    CycleAborted {
        user_id: UserId,
        session_id: SessionId,
        stuck_point: String,
        reason: AbortReason,
        timestamp: DateTime<Utc>,
    },

    NudgeSent {
        nudge_id: NudgeId,
        user_id: UserId,
        session_id: SessionId,
        stuck_point: String,
        nudge_type: NudgeType,
        count: u32,
        timestamp: DateTime<Utc>,
    },

    NudgeStatusChanged {
        nudge_id: NudgeId,
        user_id: UserId,
        status: NudgeStatus,
        timestamp: DateTime<Utc>,
    },

    /// Live delivery or alerting failed; the record is kept
    DeliveryFailed {
        user_id: UserId,
        target: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    EscalationOpened {
        escalation_id: EscalationId,
        user_id: UserId,
        stuck_point: String,
        nudge_count: u32,
        timestamp: DateTime<Utc>,
    },

    EscalationStatusChanged {
        escalation_id: EscalationId,
        user_id: UserId,
        from: EscalationStatus,
        to: EscalationStatus,
        timestamp: DateTime<Utc>,
    },

    /// The user moved past a stuck point; its counter was reset
    ProgressRecorded {
        user_id: UserId,
        session_id: SessionId,
        stuck_point: String,
        timestamp: DateTime<Utc>,
    },

    SessionClosed {
        user_id: UserId,
        session_id: SessionId,
        reason: SessionEndReason,
        timestamp: DateTime<Utc>,
    },

    CapabilityHealthChanged {
        capability: CapabilityKind,
        level: HealthLevel,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { timestamp, .. }
            | Self::TriggerFired { timestamp, .. }
            | Self::DiagnosisRecorded { timestamp, .. }
            | Self::CycleAborted { timestamp, .. }
            | Self::NudgeSent { timestamp, .. }
            | Self::NudgeStatusChanged { timestamp, .. }
            | Self::DeliveryFailed { timestamp, .. }
            | Self::EscalationOpened { timestamp, .. }
            | Self::EscalationStatusChanged { timestamp, .. }
            | Self::ProgressRecorded { timestamp, .. }
            | Self::SessionClosed { timestamp, .. }
            | Self::CapabilityHealthChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::TriggerFired { .. } => "trigger_fired",
            Self::DiagnosisRecorded { .. } => "diagnosis_recorded",
            Self::CycleAborted { .. } => "cycle_aborted",
            Self::NudgeSent { .. } => "nudge_sent",
            Self::NudgeStatusChanged { .. } => "nudge_status_changed",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::EscalationOpened { .. } => "escalation_opened",
            Self::EscalationStatusChanged { .. } => "escalation_status_changed",
            Self::ProgressRecorded { .. } => "progress_recorded",
            Self::SessionClosed { .. } => "session_closed",
            Self::CapabilityHealthChanged { .. } => "capability_health_changed",
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::SessionStarted { user_id, .. }
            | Self::TriggerFired { user_id, .. }
            | Self::DiagnosisRecorded { user_id, .. }
            | Self::CycleAborted { user_id, .. }
            | Self::NudgeSent { user_id, .. }
            | Self::NudgeStatusChanged { user_id, .. }
            | Self::DeliveryFailed { user_id, .. }
            | Self::EscalationOpened { user_id, .. }
            | Self::EscalationStatusChanged { user_id, .. }
            | Self::ProgressRecorded { user_id, .. }
            | Self::SessionClosed { user_id, .. } => Some(user_id),
            Self::CapabilityHealthChanged { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::TriggerFired { session_id, .. }
            | Self::DiagnosisRecorded { session_id, .. }
            | Self::CycleAborted { session_id, .. }
            | Self::NudgeSent { session_id, .. }
            | Self::ProgressRecorded { session_id, .. }
            | Self::SessionClosed { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = EngineEvent::TriggerFired {
            user_id: "u1".into(),
            session_id: "s1".into(),
            stuck_point: "invite_team".into(),
            kind: TriggerKind::Inactivity { idle_secs: 180 },
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert_eq!(json["kind"]["kind"], "inactivity");
        assert_eq!(event.user_id(), Some("u1"));
        assert_eq!(event.session_id(), Some("s1"));
    }

    #[test]
    fn test_escalation_events_have_no_session() {
        let event = EngineEvent::EscalationOpened {
            escalation_id: "e1".into(),
            user_id: "u1".into(),
            stuck_point: "invite_team".into(),
            nudge_count: 4,
            timestamp: Utc::now(),
        };
        assert_eq!(event.session_id(), None);
        assert_eq!(event.event_type(), "escalation_opened");
    }
}
