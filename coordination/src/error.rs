//! Engine error types
//!
//! Every failure the nudge engine can observe is represented here. None of
//! them is fatal to the process: the worst outcome of any variant is that a
//! single trigger produces no nudge.
//!
//! | Variant                       | Scope                  | Surfaced |
//! |-------------------------------|------------------------|----------|
//! | CapabilityTimeout             | aborts current trigger | logged   |
//! | CapabilityUnavailable         | aborts current trigger | logged   |
//! | CapabilityMalformedResponse   | aborts current trigger | logged   |
//! | DeliveryUnavailable           | swallowed at dispatch  | logged   |
//! | DuplicateEscalation           | absorbed by the gate   | never    |
//! | SessionNotFound               | status hooks only      | yes      |
//! | InvalidTransition             | status hooks / cycles  | yes      |
//! | InvalidConfig                 | directory loading      | yes      |
//! | UnknownRecord                 | status hooks           | yes      |
//! | CounterUnavailable            | aborts current trigger | logged   |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Which external capability produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Diagnosis,
    Coach,
    AlertDrafting,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diagnosis => write!(f, "diagnosis"),
            Self::Coach => write!(f, "coach"),
            Self::AlertDrafting => write!(f, "alert_drafting"),
        }
    }
}

/// Errors that can occur inside the nudge engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Capability did not answer within its deadline
    #[error("{capability} capability timed out after {}ms", elapsed.as_millis())]
    CapabilityTimeout {
        capability: CapabilityKind,
        elapsed: Duration,
    },

    /// Capability backend could not be reached or returned a transport error
    #[error("{capability} capability unavailable: {message}")]
    CapabilityUnavailable {
        capability: CapabilityKind,
        message: String,
    },

    /// Capability answered but the payload does not satisfy the expected shape
    #[error("{capability} capability returned a malformed response: {message}")]
    CapabilityMalformedResponse {
        capability: CapabilityKind,
        message: String,
    },

    /// Live delivery could not reach the user or the alert target
    #[error("delivery unavailable for {target}: {message}")]
    DeliveryUnavailable { target: String, message: String },

    /// An escalation is already open for this user and stuck point
    #[error("escalation already open for user {user_id} at {stuck_point}")]
    DuplicateEscalation {
        user_id: String,
        stuck_point: String,
    },

    /// Session id is not tracked
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// A state machine refused a transition
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Company directory or engine settings failed validation
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Nudge or escalation id is not known to the live state
    #[error("unknown {kind}: {id}")]
    UnknownRecord { kind: &'static str, id: String },

    /// Counter store refused an operation
    #[error("counter store unavailable: {message}")]
    CounterUnavailable { message: String },
}

impl From<crate::state::StoreError> for EngineError {
    fn from(err: crate::state::StoreError) -> Self {
        Self::CounterUnavailable {
            message: err.to_string(),
        }
    }
}

impl EngineError {
    /// Capability failures are the only errors that abort a cycle.
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            Self::CapabilityTimeout { .. }
                | Self::CapabilityUnavailable { .. }
                | Self::CapabilityMalformedResponse { .. }
        )
    }

    /// Whether retrying the exact call could succeed.
    ///
    /// Malformed payloads are not retried within a cycle; the next trigger
    /// starts a fresh business sequence instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CapabilityTimeout { .. } | Self::CapabilityUnavailable { .. }
        )
    }

    /// Machine-readable code used in audit records and engine events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapabilityTimeout { .. } => "CAPABILITY_TIMEOUT",
            Self::CapabilityUnavailable { .. } => "CAPABILITY_UNAVAILABLE",
            Self::CapabilityMalformedResponse { .. } => "CAPABILITY_MALFORMED_RESPONSE",
            Self::DeliveryUnavailable { .. } => "DELIVERY_UNAVAILABLE",
            Self::DuplicateEscalation { .. } => "DUPLICATE_ESCALATION",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::UnknownRecord { .. } => "UNKNOWN_RECORD",
            Self::CounterUnavailable { .. } => "COUNTER_UNAVAILABLE",
        }
    }

    pub fn malformed(capability: CapabilityKind, message: impl Into<String>) -> Self {
        Self::CapabilityMalformedResponse {
            capability,
            message: message.into(),
        }
    }

    pub fn unavailable(capability: CapabilityKind, message: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            capability,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_classification() {
        let timeout = EngineError::CapabilityTimeout {
            capability: CapabilityKind::Diagnosis,
            elapsed: Duration::from_millis(1500),
        };
        assert!(timeout.is_capability_failure());
        assert!(timeout.is_transient());
        assert_eq!(
            timeout.to_string(),
            "diagnosis capability timed out after 1500ms"
        );

        let malformed = EngineError::malformed(CapabilityKind::Coach, "missing content");
        assert!(malformed.is_capability_failure());
        assert!(!malformed.is_transient());
        assert_eq!(malformed.code(), "CAPABILITY_MALFORMED_RESPONSE");
    }

    #[test]
    fn test_delivery_is_not_capability_failure() {
        let err = EngineError::DeliveryUnavailable {
            target: "user-1".into(),
            message: "offline".into(),
        };
        assert!(!err.is_capability_failure());
        assert!(!err.is_transient());
    }
}
