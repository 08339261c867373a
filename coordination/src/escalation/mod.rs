//! Nudge counting, the cycle state machine and human escalation
//!
//! Pure bookkeeping with no capability calls.
//!
//! ```text
//! nudge generated ─▶ counter += 1 ─▶ count > N ? ─┬─ no  ─▶ idle
//!                                                  └─ yes ─▶ open escalation (once per key)
//!                                                              │
//!                          CSM: resolved | dismissed ◀─────────┘
//!                          (counter and nudge log reset)
//! ```

pub mod engine;
pub mod state;

pub use engine::{
    exceeds_threshold, EscalationGate, NudgeEntry, StatusChange, DEFAULT_DASHBOARD_URL,
    DEFAULT_ESCALATION_THRESHOLD,
};
pub use state::{AbortReason, CycleOutcome, CyclePhase, CycleReport, CycleState, PhaseRecord};
