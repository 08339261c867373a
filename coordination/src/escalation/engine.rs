//! Escalation Gate: nudge counters and the human escalation registry
//!
//! Deterministic bookkeeping only; no capability calls happen here.
//!
//! - Counters live in a [`CounterStore`] keyed by `(user_id, stuck_point)`.
//! - At most one unresolved escalation exists per key. `open_escalation`
//!   checks and inserts under a single lock, so a racing second caller gets
//!   `None` instead of a duplicate.
//! - Leaving `open`/`in_progress` frees the key and resets its counter and
//!   nudge log. The closed escalation is then retired: only its id and final
//!   status are remembered, in a bounded list, so late status updates still
//!   get `InvalidTransition`.
//! - A nudge entry is dropped once its key was reset and no further
//!   acknowledgment can arrive, or when it is older than the stale age passed
//!   to [`EscalationGate::prune_stale`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::state::{
    new_record_id, AlertDraft, CounterKey, Diagnosis, Escalation, EscalationId, EscalationStatus,
    Nudge, NudgeId, NudgeStatus, NudgeType, SharedCounterStore,
};

/// Default nudges tolerated before a human is looped in
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;

/// Base URL used for escalation deep links when none is configured
pub const DEFAULT_DASHBOARD_URL: &str = "http://localhost:3000";

/// Closed escalations remembered for status-hook validation
const RETIRED_ESCALATIONS: usize = 1_024;

/// Whether a counter value is past the company threshold.
pub fn exceeds_threshold(count: u32, threshold: u32) -> bool {
    count > threshold
}

/// Nudge tracked for status acknowledgments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeEntry {
    pub nudge_id: NudgeId,
    pub key: CounterKey,
    pub session_id: String,
    pub nudge_type: NudgeType,
    pub content: String,
    pub status: NudgeStatus,
    pub sent_at: DateTime<Utc>,
}

/// Result of a CSM status update
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub escalation: Escalation,
    pub previous: EscalationStatus,
    /// Key was freed and its counter reset
    pub released: bool,
    /// Counter value before the reset
    pub cleared_count: u32,
}

#[derive(Default)]
struct GateState {
    escalations: HashMap<EscalationId, Escalation>,
    /// Unresolved escalation per key
    open: HashMap<CounterKey, EscalationId>,
    nudge_logs: HashMap<CounterKey, Vec<NudgeId>>,
    nudges: HashMap<NudgeId, NudgeEntry>,
    /// Final status of recently closed escalations, oldest first
    retired: VecDeque<(EscalationId, EscalationStatus)>,
}

impl GateState {
    /// Clear the nudge log of a key. Entries that already reached a terminal
    /// status go with it; the others wait for their last acknowledgment.
    fn forget_key(&mut self, key: &CounterKey) {
        let Some(log) = self.nudge_logs.remove(key) else {
            return;
        };
        for nudge_id in log {
            if self
                .nudges
                .get(&nudge_id)
                .is_some_and(|n| n.status.is_terminal())
            {
                self.nudges.remove(&nudge_id);
            }
        }
    }

    fn is_logged(&self, entry: &NudgeEntry) -> bool {
        self.nudge_logs
            .get(&entry.key)
            .is_some_and(|log| log.contains(&entry.nudge_id))
    }

    fn retire(&mut self, escalation_id: &str) {
        if let Some(escalation) = self.escalations.remove(escalation_id) {
            self.retired
                .push_back((escalation.escalation_id, escalation.status));
            while self.retired.len() > RETIRED_ESCALATIONS {
                self.retired.pop_front();
            }
        }
    }
}

/// Counter and escalation registry shared by all cycles
pub struct EscalationGate {
    counters: SharedCounterStore,
    state: Mutex<GateState>,
    dashboard_url: String,
}

impl EscalationGate {
    pub fn new(counters: SharedCounterStore) -> Self {
        Self {
            counters,
            state: Mutex::new(GateState::default()),
            dashboard_url: DEFAULT_DASHBOARD_URL.to_string(),
        }
    }

    /// Set the dashboard base URL used for deep links.
    pub fn with_dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // the registry holds plain maps; a panic mid-update cannot leave them torn
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment the counter for this key and return the new value.
    pub fn record_and_check(&self, user_id: &str, stuck_point: &str) -> EngineResult<u32> {
        self.record_and_check_at(&CounterKey::new(user_id, stuck_point), Utc::now())
    }

    pub fn record_and_check_at(&self, key: &CounterKey, now: DateTime<Utc>) -> EngineResult<u32> {
        let count = self.counters.increment(key, now)?;
        debug!(key = %key, count, "Nudge counter incremented");
        Ok(count)
    }

    pub fn current_count(&self, key: &CounterKey) -> EngineResult<u32> {
        Ok(self.counters.get(key, Utc::now())?)
    }

    /// `count > threshold` and no unresolved escalation for the key.
    pub fn should_escalate(&self, key: &CounterKey, count: u32, threshold: u32) -> bool {
        exceeds_threshold(count, threshold) && !self.has_open_escalation(key)
    }

    pub fn has_open_escalation(&self, key: &CounterKey) -> bool {
        self.lock().open.contains_key(key)
    }

    pub fn open_escalation_for(&self, key: &CounterKey) -> Option<Escalation> {
        let state = self.lock();
        state
            .open
            .get(key)
            .and_then(|id| state.escalations.get(id))
            .cloned()
    }

    /// Track a generated nudge under its key.
    pub fn record_nudge(&self, nudge: &Nudge) {
        let key = CounterKey::new(nudge.user_id.clone(), nudge.stuck_point.clone());
        let mut state = self.lock();
        state
            .nudge_logs
            .entry(key.clone())
            .or_default()
            .push(nudge.nudge_id.clone());
        state.nudges.insert(
            nudge.nudge_id.clone(),
            NudgeEntry {
                nudge_id: nudge.nudge_id.clone(),
                key,
                session_id: nudge.session_id.clone(),
                nudge_type: nudge.nudge_type,
                content: nudge.content.clone(),
                status: nudge.status,
                sent_at: nudge.sent_at,
            },
        );
    }

    /// Nudge ids recorded for a key since its last reset, oldest first.
    pub fn nudge_log(&self, key: &CounterKey) -> Vec<NudgeId> {
        self.lock().nudge_logs.get(key).cloned().unwrap_or_default()
    }

    /// Last `limit` nudges for a key, oldest first.
    pub fn recent_nudges(&self, key: &CounterKey, limit: usize) -> Vec<NudgeEntry> {
        let state = self.lock();
        let Some(log) = state.nudge_logs.get(key) else {
            return Vec::new();
        };
        let start = log.len().saturating_sub(limit);
        log[start..]
            .iter()
            .filter_map(|id| state.nudges.get(id))
            .cloned()
            .collect()
    }

    pub fn nudge(&self, nudge_id: &str) -> Option<NudgeEntry> {
        self.lock().nudges.get(nudge_id).cloned()
    }

    /// Apply a client acknowledgment. Returns the previous status.
    pub fn update_nudge_status(
        &self,
        nudge_id: &str,
        status: NudgeStatus,
    ) -> EngineResult<NudgeStatus> {
        let mut state = self.lock();
        let entry = state
            .nudges
            .get_mut(nudge_id)
            .ok_or_else(|| EngineError::UnknownRecord {
                kind: "nudge",
                id: nudge_id.to_string(),
            })?;
        if !entry.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                entity: "nudge",
                from: entry.status.to_string(),
                to: status.to_string(),
            });
        }
        let previous = entry.status;
        entry.status = status;
        if status.is_terminal() {
            let done = state
                .nudges
                .get(nudge_id)
                .is_some_and(|entry| !state.is_logged(entry));
            if done {
                state.nudges.remove(nudge_id);
            }
        }
        Ok(previous)
    }

    /// Open an escalation unless one is already unresolved for the key.
    ///
    /// Check and insert happen under one lock. A duplicate is absorbed and
    /// reported as `None`.
    pub fn open_escalation(
        &self,
        company_id: &str,
        diagnosis: &Diagnosis,
        nudge_count: u32,
        alert: Option<AlertDraft>,
    ) -> Option<Escalation> {
        let key = CounterKey::new(diagnosis.user_id.clone(), diagnosis.stuck_point.clone());
        let mut state = self.lock();
        if let Some(existing) = state.open.get(&key) {
            let duplicate = EngineError::DuplicateEscalation {
                user_id: key.user_id.clone(),
                stuck_point: key.stuck_point.clone(),
            };
            debug!(escalation_id = %existing, "{}", duplicate);
            return None;
        }

        let escalation_id = new_record_id();
        let escalation = Escalation {
            deep_link: format!("{}/escalations/{}", self.dashboard_url, escalation_id),
            escalation_id: escalation_id.clone(),
            user_id: key.user_id.clone(),
            company_id: company_id.to_string(),
            stuck_point: key.stuck_point.clone(),
            inferred_reason: diagnosis.inferred_reason.clone(),
            nudge_log: state.nudge_logs.get(&key).cloned().unwrap_or_default(),
            nudge_count,
            status: EscalationStatus::Open,
            alert,
            created_at: Utc::now(),
        };
        state.open.insert(key, escalation_id.clone());
        state
            .escalations
            .insert(escalation_id.clone(), escalation.clone());

        info!(
            escalation_id = %escalation_id,
            user_id = %escalation.user_id,
            stuck_point = %escalation.stuck_point,
            nudge_count,
            "Escalation opened"
        );
        Some(escalation)
    }

    pub fn escalation(&self, escalation_id: &str) -> Option<Escalation> {
        self.lock().escalations.get(escalation_id).cloned()
    }

    /// Unresolved escalations, oldest first.
    pub fn open_escalations(&self) -> Vec<Escalation> {
        let state = self.lock();
        let mut open: Vec<Escalation> = state
            .open
            .values()
            .filter_map(|id| state.escalations.get(id))
            .cloned()
            .collect();
        open.sort_by_key(|e| e.created_at);
        open
    }

    /// CSM status change. Leaving `open`/`in_progress` frees the key and
    /// resets the counter and nudge log.
    pub fn update_escalation_status(
        &self,
        escalation_id: &str,
        status: EscalationStatus,
    ) -> EngineResult<StatusChange> {
        let mut state = self.lock();
        if let Some((_, last)) = state.retired.iter().find(|(id, _)| id == escalation_id) {
            return Err(EngineError::InvalidTransition {
                entity: "escalation",
                from: last.to_string(),
                to: status.to_string(),
            });
        }
        let escalation = state
            .escalations
            .get_mut(escalation_id)
            .ok_or_else(|| EngineError::UnknownRecord {
                kind: "escalation",
                id: escalation_id.to_string(),
            })?;
        let previous = escalation.status;
        if !previous.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                entity: "escalation",
                from: previous.to_string(),
                to: status.to_string(),
            });
        }
        escalation.status = status;
        let escalation = escalation.clone();

        let released = previous.is_unresolved() && !status.is_unresolved();
        let mut cleared_count = 0;
        if released {
            let key = CounterKey::new(escalation.user_id.clone(), escalation.stuck_point.clone());
            state.open.remove(&key);
            state.forget_key(&key);
            state.retire(escalation_id);
            drop(state);
            cleared_count = self.counters.reset(&key)?;
        }

        info!(
            escalation_id,
            from = %previous,
            to = %status,
            released,
            "Escalation status updated"
        );
        Ok(StatusChange {
            escalation,
            previous,
            released,
            cleared_count,
        })
    }

    /// The user progressed past the stuck point: clear counter and nudge log.
    ///
    /// An unresolved escalation stays open for the CSM to close.
    pub fn resolve(&self, user_id: &str, stuck_point: &str) -> EngineResult<u32> {
        let key = CounterKey::new(user_id, stuck_point);
        self.lock().forget_key(&key);
        let cleared = self.counters.reset(&key)?;
        if cleared > 0 {
            debug!(key = %key, cleared, "Nudge counter reset on progress");
        }
        Ok(cleared)
    }

    /// Drop nudge entries sent more than `max_age` before `now`, along with
    /// their log positions. Returns how many entries went.
    pub fn prune_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let mut state = self.lock();
        let stale: Vec<NudgeId> = state
            .nudges
            .values()
            .filter(|n| n.sent_at < cutoff)
            .map(|n| n.nudge_id.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }
        for nudge_id in &stale {
            state.nudges.remove(nudge_id);
        }
        state.nudge_logs.retain(|_, log| {
            log.retain(|id| !stale.contains(id));
            !log.is_empty()
        });
        debug!(pruned = stale.len(), "Stale nudge entries dropped");
        stale.len()
    }

    /// Nudge entries currently tracked
    pub fn tracked_nudges(&self) -> usize {
        self.lock().nudges.len()
    }
}
