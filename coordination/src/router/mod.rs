//! Decision Router
//!
//! Gates a diagnosis on its confidence before any nudge is generated.
//!
//! ```text
//! confidence >= threshold  → Proceed  (coach, count, maybe escalate)
//! confidence <  threshold  → Abort    (user is probably fine; nothing changes)
//! ```
//!
//! Abort is a strict short-circuit: the router is pure and the engine does
//! not touch counters or escalation state on that path.

use serde::{Deserialize, Serialize};

use crate::state::Diagnosis;

/// Default minimum confidence for acting on a diagnosis
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Routing decision for a diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Proceed,
    Abort,
}

impl Route {
    pub fn is_proceed(self) -> bool {
        self == Self::Proceed
    }
}

/// Route a diagnosis against a confidence threshold.
///
/// Thresholds outside `[0, 1]` are clamped so a misconfigured company can
/// neither disable nor unconditionally block routing.
pub fn route(diagnosis: &Diagnosis, threshold: f64) -> Route {
    let threshold = if threshold.is_nan() {
        DEFAULT_CONFIDENCE_THRESHOLD
    } else {
        threshold.clamp(0.0, 1.0)
    };
    if diagnosis.confidence_score >= threshold {
        Route::Proceed
    } else {
        Route::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn diagnosis(confidence: f64) -> Diagnosis {
        Diagnosis {
            diagnosis_id: "d1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            stuck_point: "invite_team".into(),
            inferred_reason: "hesitating on the invite modal".into(),
            confidence_score: confidence,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(route(&diagnosis(0.6), 0.6), Route::Proceed);
        assert_eq!(route(&diagnosis(0.59), 0.6), Route::Abort);
        assert_eq!(route(&diagnosis(0.4), DEFAULT_CONFIDENCE_THRESHOLD), Route::Abort);
    }

    #[test]
    fn test_never_proceeds_below_threshold() {
        for t in 0..=20 {
            let threshold = t as f64 / 20.0;
            for c in 0..=20 {
                let confidence = c as f64 / 20.0;
                let r = route(&diagnosis(confidence), threshold);
                if confidence < threshold {
                    assert_eq!(r, Route::Abort, "c={confidence} t={threshold}");
                } else {
                    assert_eq!(r, Route::Proceed, "c={confidence} t={threshold}");
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_threshold_is_clamped() {
        assert_eq!(route(&diagnosis(1.0), 1.5), Route::Proceed);
        assert_eq!(route(&diagnosis(0.0), -1.0), Route::Proceed);
        assert_eq!(route(&diagnosis(0.5), f64::NAN), Route::Abort);
    }
}
