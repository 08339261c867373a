//! Integration tests for the escalation gate
//!
//! Drives the gate the way the engine does per cycle: route, count, check,
//! open, and later the CSM status hooks.

use chrono::Utc;
use coordination::escalation::{CycleOutcome, CyclePhase, CycleState, EscalationGate};
use coordination::router::{route, Route};
use coordination::state::{
    CounterKey, Diagnosis, EscalationStatus, InMemoryCounterStore, Nudge, NudgeContent, NudgeType,
};

const THRESHOLD: u32 = 3;

fn diagnosis(confidence: f64) -> Diagnosis {
    Diagnosis {
        diagnosis_id: coordination::state::new_record_id(),
        user_id: "u1".into(),
        session_id: "s1".into(),
        stuck_point: "invite_team".into(),
        inferred_reason: "does not know teammates' emails yet".into(),
        confidence_score: confidence,
        created_at: Utc::now(),
    }
}

/// One cycle as the engine runs it, minus the capability calls.
fn run_cycle(gate: &EscalationGate, confidence: f64) -> CycleOutcome {
    let key = CounterKey::new("u1", "invite_team");
    let mut cycle = CycleState::new(key.clone());
    cycle.advance(CyclePhase::Triggered).unwrap();
    cycle.advance(CyclePhase::Diagnosing).unwrap();

    let d = diagnosis(confidence);
    if route(&d, 0.6) == Route::Abort {
        cycle.advance(CyclePhase::Aborted).unwrap();
        return CycleOutcome::Aborted {
            reason: coordination::escalation::AbortReason::LowConfidence {
                confidence,
                threshold: 0.6,
            },
        };
    }
    cycle.advance(CyclePhase::Routed).unwrap();
    cycle.advance(CyclePhase::Coaching).unwrap();
    let nudge = Nudge::new(
        "acme",
        d.clone(),
        NudgeContent {
            nudge_type: NudgeType::InAppChat,
            content: "Invites can wait; try the project board first.".into(),
            target_element_id: None,
        },
    );
    cycle.advance(CyclePhase::NudgeSent).unwrap();

    let count = gate.record_and_check("u1", "invite_team").unwrap();
    gate.record_nudge(&nudge);
    cycle.advance(CyclePhase::Counted).unwrap();

    if gate.should_escalate(&key, count, THRESHOLD) {
        if let Some(escalation) = gate.open_escalation("acme", &d, count, None) {
            cycle.advance(CyclePhase::OpenEscalation).unwrap();
            return CycleOutcome::Escalated {
                nudge_id: nudge.nudge_id,
                count,
                escalation_id: escalation.escalation_id,
                delivered: true,
                delivery_suppressed: false,
            };
        }
    }
    cycle.advance(CyclePhase::Idle).unwrap();
    CycleOutcome::Nudged {
        nudge_id: nudge.nudge_id,
        count,
        delivered: true,
        delivery_suppressed: false,
    }
}

#[test]
fn test_fourth_nudge_escalates_exactly_once() {
    let gate = EscalationGate::new(InMemoryCounterStore::new().shared());
    let outcomes: Vec<CycleOutcome> = (0..5).map(|_| run_cycle(&gate, 0.9)).collect();

    let escalated: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| matches!(o, CycleOutcome::Escalated { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(escalated, vec![3], "only the 4th nudge escalates");
    assert_eq!(outcomes[4].count(), Some(5));

    let open = gate.open_escalations();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].nudge_count, 4);
    assert_eq!(open[0].nudge_log.len(), 4);
}

#[test]
fn test_low_confidence_changes_nothing() {
    let gate = EscalationGate::new(InMemoryCounterStore::new().shared());
    let key = CounterKey::new("u1", "invite_team");
    for _ in 0..10 {
        assert!(run_cycle(&gate, 0.4).is_aborted());
    }
    assert_eq!(gate.current_count(&key).unwrap(), 0);
    assert!(gate.nudge_log(&key).is_empty());
    assert!(gate.open_escalations().is_empty());
}

#[test]
fn test_dismissal_allows_a_new_escalation_later() {
    let gate = EscalationGate::new(InMemoryCounterStore::new().shared());
    for _ in 0..4 {
        run_cycle(&gate, 0.9);
    }
    let first = gate.open_escalations().remove(0);
    let change = gate
        .update_escalation_status(&first.escalation_id, EscalationStatus::Dismissed)
        .unwrap();
    assert!(change.released);

    // counter starts over: three more nudges stay below the threshold
    for _ in 0..3 {
        assert!(matches!(run_cycle(&gate, 0.9), CycleOutcome::Nudged { .. }));
    }
    assert!(matches!(run_cycle(&gate, 0.9), CycleOutcome::Escalated { .. }));

    let open = gate.open_escalations();
    assert_eq!(open.len(), 1);
    assert_ne!(open[0].escalation_id, first.escalation_id);
}
