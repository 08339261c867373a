//! Baseline Matcher: compares observed behavior against the success path
//!
//! Progress is assumed to be monotonic along the baseline: the user should
//! complete the steps in order. Event types that never appear in the baseline
//! (page views, generic clicks) are noise and are skipped before matching.
//!
//! ```text
//! baseline:  signup → create_project → invite_team
//! observed:  signup, page_view, create_project, click
//! projected: signup, create_project
//! matched:   2            stuck_point: invite_team
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::state::Baseline;

/// Where the observed sequence stopped agreeing with the baseline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    /// Baseline position of the first disagreement
    pub position: usize,
    /// Observed event type at that position
    pub observed: String,
    /// Baseline event type expected at that position
    pub expected: String,
}

/// Result of comparing a session against its baseline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviationSummary {
    /// Length of the longest common prefix
    pub matched: usize,
    /// Number of steps in the baseline
    pub baseline_len: usize,
    /// First baseline step not yet completed in order; `None` once the whole
    /// baseline has been matched
    pub stuck_point: Option<String>,
    /// Set when an out-of-order baseline event was observed
    pub divergence: Option<Divergence>,
    /// Baseline steps after the match, in order
    pub pending: Vec<String>,
}

impl DeviationSummary {
    /// The user has completed the baseline (or it is empty).
    pub fn is_complete(&self) -> bool {
        self.stuck_point.is_none()
    }

    /// The user did something out of order rather than just stopping.
    pub fn is_out_of_order(&self) -> bool {
        self.divergence.is_some()
    }

    /// Raise the match to `floor` steps when the observed history no longer
    /// shows steps completed earlier (a trimmed window).
    pub fn at_least(self, baseline: &Baseline, floor: usize) -> Self {
        if self.matched >= floor {
            return self;
        }
        let expected: Vec<&str> = baseline.event_types().collect();
        let matched = floor.min(expected.len());
        Self {
            matched,
            baseline_len: expected.len(),
            stuck_point: expected.get(matched).map(|s| s.to_string()),
            divergence: None,
            pending: expected[matched..].iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Completion ratio along the baseline, 1.0 for an empty baseline
    pub fn progress(&self) -> f64 {
        if self.baseline_len == 0 {
            1.0
        } else {
            self.matched as f64 / self.baseline_len as f64
        }
    }
}

/// Compare an observed event type sequence against a baseline.
pub fn deviation<S: AsRef<str>>(event_sequence: &[S], baseline: &Baseline) -> DeviationSummary {
    let expected: Vec<&str> = baseline.event_types().collect();
    let vocabulary: HashSet<&str> = expected.iter().copied().collect();

    let projected: Vec<&str> = event_sequence
        .iter()
        .map(AsRef::as_ref)
        .filter(|t| vocabulary.contains(t))
        .collect();

    let matched = projected
        .iter()
        .zip(expected.iter())
        .take_while(|(observed, expected)| observed == expected)
        .count();

    let divergence = if matched < expected.len() && matched < projected.len() {
        Some(Divergence {
            position: matched,
            observed: projected[matched].to_string(),
            expected: expected[matched].to_string(),
        })
    } else {
        None
    };

    DeviationSummary {
        matched,
        baseline_len: expected.len(),
        stuck_point: expected.get(matched).map(|s| s.to_string()),
        divergence,
        pending: expected[matched..].iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onboarding() -> Baseline {
        Baseline::from_event_types("acme", ["signup", "create_project", "invite_team"])
    }

    #[test]
    fn test_prefix_reports_next_step() {
        let d = deviation(&["signup", "create_project"], &onboarding());
        assert_eq!(d.matched, 2);
        assert_eq!(d.stuck_point.as_deref(), Some("invite_team"));
        assert!(!d.is_out_of_order());
        assert_eq!(d.pending, vec!["invite_team"]);
    }

    #[test]
    fn test_complete_or_ahead_reports_nothing() {
        let d = deviation(
            &["signup", "create_project", "invite_team"],
            &onboarding(),
        );
        assert!(d.is_complete());
        assert_eq!(d.progress(), 1.0);

        let d = deviation(
            &["signup", "create_project", "invite_team", "invite_team"],
            &onboarding(),
        );
        assert!(d.is_complete());
        assert!(d.divergence.is_none());
    }

    #[test]
    fn test_divergence_reports_baseline_element_at_position() {
        let baseline = onboarding();
        // diverges at position 1
        let d = deviation(&["signup", "invite_team", "create_project"], &baseline);
        assert_eq!(d.stuck_point.as_deref(), Some("create_project"));
        let div = d.divergence.unwrap();
        assert_eq!(div.position, 1);
        assert_eq!(div.observed, "invite_team");
        assert_eq!(div.expected, "create_project");

        // diverges at position 0
        let d = deviation(&["create_project"], &baseline);
        assert_eq!(d.stuck_point.as_deref(), Some("signup"));
    }

    #[test]
    fn test_noise_events_are_ignored() {
        let d = deviation(
            &["page_view", "signup", "click", "help_click", "create_project"],
            &onboarding(),
        );
        assert_eq!(d.matched, 2);
        assert_eq!(d.stuck_point.as_deref(), Some("invite_team"));
    }

    #[test]
    fn test_every_divergence_position() {
        let steps = ["a", "b", "c", "d", "e"];
        let baseline = Baseline::from_event_types("acme", steps);
        for k in 0..steps.len() {
            let mut observed: Vec<&str> = steps[..k].to_vec();
            // a later step observed in place of steps[k]
            observed.push(steps[(k + 1) % steps.len()]);
            let d = deviation(&observed, &baseline);
            assert_eq!(d.stuck_point.as_deref(), Some(steps[k]), "k={k}");
            assert_eq!(d.matched, k);
        }
    }

    #[test]
    fn test_recorded_progress_is_a_floor() {
        let baseline = onboarding();
        // early steps no longer visible in the observed history
        let d = deviation(&["invite_team"], &baseline).at_least(&baseline, 2);
        assert_eq!(d.matched, 2);
        assert_eq!(d.stuck_point.as_deref(), Some("invite_team"));
        assert!(d.divergence.is_none());

        let d = deviation(&["signup", "create_project", "invite_team"], &baseline)
            .at_least(&baseline, 1);
        assert!(d.is_complete());

        let d = deviation::<&str>(&[], &baseline).at_least(&baseline, 7);
        assert_eq!(d.matched, 3);
        assert!(d.is_complete());
    }

    #[test]
    fn test_empty_inputs() {
        let empty = Baseline::from_event_types("acme", Vec::<String>::new());
        assert!(deviation(&["signup"], &empty).is_complete());

        let d = deviation::<&str>(&[], &onboarding());
        assert_eq!(d.stuck_point.as_deref(), Some("signup"));
        assert_eq!(d.progress(), 0.0);
    }
}
