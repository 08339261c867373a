//! Friction signals: detect when a user appears stuck
//!
//! Two kinds of signal start a diagnosis cycle:
//! - an explicit stuck signature (help/cancel/back clicks, surfaced errors),
//!   optionally narrowed to target elements matching a pattern
//! - inactivity: the user went quiet for longer than the idle threshold

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::Event;

/// Event types treated as stuck signals when no signatures are configured
pub const DEFAULT_STUCK_EVENT_TYPES: [&str; 4] =
    ["help_click", "cancel_click", "back_click", "error_encountered"];

/// Configured stuck signature, as written in the company directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckSignature {
    pub event_type: String,
    /// Regex the target element must match; any target when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pattern: Option<String>,
}

impl StuckSignature {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            target_pattern: None,
        }
    }

    pub fn on_target(mut self, pattern: impl Into<String>) -> Self {
        self.target_pattern = Some(pattern.into());
        self
    }

    pub fn defaults() -> Vec<Self> {
        DEFAULT_STUCK_EVENT_TYPES.iter().map(|t| Self::new(*t)).collect()
    }
}

/// Why a trigger fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// No activity for longer than the idle threshold
    Inactivity { idle_secs: i64 },
    /// Event matched a stuck signature
    StuckSignal {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_element: Option<String>,
    },
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactivity { idle_secs } => write!(f, "inactive for {}s", idle_secs),
            Self::StuckSignal {
                event_type,
                target_element: Some(target),
            } => write!(f, "{} on {}", event_type, target),
            Self::StuckSignal { event_type, .. } => write!(f, "{}", event_type),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledSignature {
    event_type: String,
    target: Option<Regex>,
}

impl CompiledSignature {
    fn matches(&self, event: &Event) -> bool {
        if event.event_type != self.event_type {
            return false;
        }
        match (&self.target, &event.target_element) {
            (None, _) => true,
            (Some(re), Some(target)) => re.is_match(target),
            (Some(_), None) => false,
        }
    }
}

/// Stateless detector for friction signals
#[derive(Debug, Clone)]
pub struct FrictionDetector {
    signatures: Vec<CompiledSignature>,
    idle_threshold: Duration,
}

impl FrictionDetector {
    /// Compile signatures; an invalid target pattern is a configuration error.
    pub fn new(signatures: &[StuckSignature], idle_threshold: Duration) -> EngineResult<Self> {
        let signatures = signatures
            .iter()
            .map(|s| {
                let target = s
                    .target_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        EngineError::invalid_config(format!(
                            "bad target_pattern for {}: {}",
                            s.event_type, e
                        ))
                    })?;
                Ok(CompiledSignature {
                    event_type: s.event_type.clone(),
                    target,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self {
            signatures,
            idle_threshold,
        })
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Whether an event matches any stuck signature.
    pub fn is_stuck_signal(&self, event: &Event) -> bool {
        self.signatures.iter().any(|s| s.matches(event))
    }

    /// Inspect an incoming event against the session's previous activity.
    ///
    /// A stuck signature wins over inactivity when both apply.
    pub fn detect(&self, last_seen: Option<DateTime<Utc>>, event: &Event) -> Option<TriggerKind> {
        if self.is_stuck_signal(event) {
            return Some(TriggerKind::StuckSignal {
                event_type: event.event_type.clone(),
                target_element: event.target_element.clone(),
            });
        }
        let gap = event.timestamp - last_seen?;
        self.idle(gap)
    }

    /// Inactivity check used by the periodic sweep.
    pub fn detect_idle(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> Option<TriggerKind> {
        self.idle(now - last_seen)
    }

    fn idle(&self, gap: Duration) -> Option<TriggerKind> {
        (gap > self.idle_threshold).then(|| TriggerKind::Inactivity {
            idle_secs: gap.num_seconds(),
        })
    }
}
