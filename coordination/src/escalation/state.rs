//! Cycle State: the per-trigger state machine
//!
//! Every trigger walks this fixed graph once:
//!
//! ```text
//! idle → triggered → diagnosing ─┬─▶ aborted
//!                                └─▶ routed → coaching ─┬─▶ aborted
//!                                                       └─▶ nudge_sent → counted ─┬─▶ open_escalation
//!                                                                                 └─▶ idle
//! ```
//!
//! `aborted`, `open_escalation` and the final `idle` are terminal for the
//! cycle. The graph is small and fixed, so transitions are checked with a
//! plain match instead of a generic workflow engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::{CounterKey, EscalationId, NudgeId};

/// Phases of a trigger cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Triggered,
    Diagnosing,
    Aborted,
    Routed,
    Coaching,
    NudgeSent,
    Counted,
    OpenEscalation,
}

impl CyclePhase {
    /// Whether `next` is a legal successor of this phase.
    pub fn can_transition_to(self, next: CyclePhase) -> bool {
        use CyclePhase::*;
        matches!(
            (self, next),
            (Idle, Triggered)
                | (Triggered, Diagnosing)
                | (Triggered, Aborted)
                | (Diagnosing, Aborted)
                | (Diagnosing, Routed)
                | (Routed, Coaching)
                | (Coaching, Aborted)
                | (Coaching, NudgeSent)
                | (NudgeSent, Counted)
                | (Counted, OpenEscalation)
                | (Counted, Idle)
        )
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Triggered => "triggered",
            Self::Diagnosing => "diagnosing",
            Self::Aborted => "aborted",
            Self::Routed => "routed",
            Self::Coaching => "coaching",
            Self::NudgeSent => "nudge_sent",
            Self::Counted => "counted",
            Self::OpenEscalation => "open_escalation",
        };
        write!(f, "{}", s)
    }
}

/// Why a cycle stopped before sending a nudge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// Diagnosis capability failed (timeout, unavailable or malformed)
    DiagnosisFailed { code: String, message: String },
    /// Confidence below the company threshold
    LowConfidence { confidence: f64, threshold: f64 },
    /// Coach capability failed
    CoachFailed { code: String, message: String },
    /// Company has no usable configuration
    MissingContext { message: String },
}

impl AbortReason {
    pub fn from_error(phase: CyclePhase, err: &EngineError) -> Self {
        match phase {
            CyclePhase::Coaching => Self::CoachFailed {
                code: err.code().to_string(),
                message: err.to_string(),
            },
            _ => Self::DiagnosisFailed {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Capability failures re-arm the trigger so the next signal retries.
    pub fn is_capability_failure(&self) -> bool {
        matches!(self, Self::DiagnosisFailed { .. } | Self::CoachFailed { .. })
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DiagnosisFailed { code, .. } => write!(f, "diagnosis failed ({})", code),
            Self::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "confidence {:.2} below {:.2}", confidence, threshold),
            Self::CoachFailed { code, .. } => write!(f, "coach failed ({})", code),
            Self::MissingContext { message } => write!(f, "missing context: {}", message),
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Aborted {
        reason: AbortReason,
    },
    Nudged {
        nudge_id: NudgeId,
        count: u32,
        /// Live delivery reached the user
        delivered: bool,
        /// Session closed while the cycle was in flight
        delivery_suppressed: bool,
    },
    Escalated {
        nudge_id: NudgeId,
        count: u32,
        escalation_id: EscalationId,
        delivered: bool,
        delivery_suppressed: bool,
    },
}

impl CycleOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn nudge_id(&self) -> Option<&str> {
        match self {
            Self::Aborted { .. } => None,
            Self::Nudged { nudge_id, .. } | Self::Escalated { nudge_id, .. } => Some(nudge_id),
        }
    }

    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Aborted { .. } => None,
            Self::Nudged { count, .. } | Self::Escalated { count, .. } => Some(*count),
        }
    }
}

/// A visited phase with its entry time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: CyclePhase,
    pub at: DateTime<Utc>,
}

/// State of one in-flight cycle for a counter key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    pub key: CounterKey,
    pub current: CyclePhase,
    pub history: Vec<PhaseRecord>,
}

impl CycleState {
    /// New cycle in `idle`.
    pub fn new(key: CounterKey) -> Self {
        Self {
            key,
            current: CyclePhase::Idle,
            history: vec![PhaseRecord {
                phase: CyclePhase::Idle,
                at: Utc::now(),
            }],
        }
    }

    /// Move to `next`, rejecting edges outside the graph.
    pub fn advance(&mut self, next: CyclePhase) -> EngineResult<()> {
        if !self.current.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "cycle",
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        self.history.push(PhaseRecord {
            phase: next,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn phases(&self) -> Vec<CyclePhase> {
        self.history.iter().map(|r| r.phase).collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.current,
            CyclePhase::Aborted | CyclePhase::OpenEscalation
        ) || (self.current == CyclePhase::Idle && self.history.len() > 1)
    }

    /// Close the cycle into a report.
    pub fn finish(self, outcome: CycleOutcome) -> CycleReport {
        CycleReport {
            key: self.key,
            phases: self.history.iter().map(|r| r.phase).collect(),
            outcome,
            started_at: self.history.first().map(|r| r.at).unwrap_or_else(Utc::now),
            finished_at: Utc::now(),
        }
    }
}

/// Summary of a finished cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub key: CounterKey,
    pub phases: Vec<CyclePhase>,
    pub outcome: CycleOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CounterKey {
        CounterKey::new("u1", "invite_team")
    }

    #[test]
    fn test_happy_path_to_idle() {
        let mut s = CycleState::new(key());
        for phase in [
            CyclePhase::Triggered,
            CyclePhase::Diagnosing,
            CyclePhase::Routed,
            CyclePhase::Coaching,
            CyclePhase::NudgeSent,
            CyclePhase::Counted,
            CyclePhase::Idle,
        ] {
            s.advance(phase).unwrap();
        }
        assert!(s.is_terminal());
        assert_eq!(s.phases().len(), 8);
    }

    #[test]
    fn test_escalation_path() {
        let mut s = CycleState::new(key());
        for phase in [
            CyclePhase::Triggered,
            CyclePhase::Diagnosing,
            CyclePhase::Routed,
            CyclePhase::Coaching,
            CyclePhase::NudgeSent,
            CyclePhase::Counted,
            CyclePhase::OpenEscalation,
        ] {
            s.advance(phase).unwrap();
        }
        assert!(s.is_terminal());
        let report = s.finish(CycleOutcome::Escalated {
            nudge_id: "n4".into(),
            count: 4,
            escalation_id: "e1".into(),
            delivered: true,
            delivery_suppressed: false,
        });
        assert_eq!(report.phases.last(), Some(&CyclePhase::OpenEscalation));
        assert_eq!(report.outcome.count(), Some(4));
    }

    #[test]
    fn test_cannot_skip_coaching() {
        let mut s = CycleState::new(key());
        s.advance(CyclePhase::Triggered).unwrap();
        s.advance(CyclePhase::Diagnosing).unwrap();
        s.advance(CyclePhase::Routed).unwrap();
        let err = s.advance(CyclePhase::NudgeSent).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(s.current, CyclePhase::Routed);
    }

    #[test]
    fn test_aborted_is_terminal() {
        let mut s = CycleState::new(key());
        s.advance(CyclePhase::Triggered).unwrap();
        s.advance(CyclePhase::Diagnosing).unwrap();
        s.advance(CyclePhase::Aborted).unwrap();
        assert!(s.is_terminal());
        assert!(s.advance(CyclePhase::Routed).is_err());
        assert!(!CyclePhase::Aborted.can_transition_to(CyclePhase::Idle));
    }

    #[test]
    fn test_abort_reason_serialization() {
        let reason = AbortReason::LowConfidence {
            confidence: 0.4,
            threshold: 0.6,
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"reason\":\"low_confidence\""), "JSON: {json}");
        assert!(!reason.is_capability_failure());
        assert_eq!(reason.to_string(), "confidence 0.40 below 0.60");
    }
}
