//! Per-session event window
//!
//! Holds the ordered events of one session together with the trigger
//! bookkeeping that keeps detection idempotent.

use std::collections::HashSet;

use serde::Serialize;

use crate::baseline::{deviation, DeviationSummary};
use crate::state::{Baseline, Event, Session};

#[derive(Debug, Clone)]
struct WindowEntry {
    arrival: u64,
    event: Event,
}

/// Session plus its ordered event window
#[derive(Debug, Clone)]
pub struct SessionWindow {
    pub session: Session,
    entries: Vec<WindowEntry>,
    seen_ids: HashSet<String>,
    /// Stuck points a trigger already fired for in this session
    fired: HashSet<String>,
    /// Baseline steps matched so far; never decreases
    matched: usize,
    /// Event types of the company baseline, kept over noise on eviction
    vocabulary: HashSet<String>,
    max_events: usize,
}

/// Serializable view of a session for live observers
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub last_event: Option<String>,
    pub fired_stuck_points: Vec<String>,
    pub baseline_progress: usize,
}

impl SessionWindow {
    pub fn new(first: &Event, max_events: usize) -> Self {
        Self {
            session: Session::new(first),
            entries: Vec::new(),
            seen_ids: HashSet::new(),
            fired: HashSet::new(),
            matched: 0,
            vocabulary: HashSet::new(),
            max_events: max_events.max(1),
        }
    }

    /// Whether this event id was already recorded.
    pub fn is_duplicate(&self, event: &Event) -> bool {
        event
            .event_id
            .as_ref()
            .is_some_and(|id| self.seen_ids.contains(id))
    }

    /// Insert in (timestamp, arrival) order and bump activity.
    pub fn insert(&mut self, event: Event, arrival: u64) {
        if let Some(id) = &event.event_id {
            self.seen_ids.insert(id.clone());
        }
        if event.timestamp > self.session.last_seen_time {
            self.session.last_seen_time = event.timestamp;
        }
        if event.timestamp < self.session.start_time {
            self.session.start_time = event.timestamp;
        }
        self.session.event_count += 1;
        self.session.is_active = true;

        let pos = self
            .entries
            .partition_point(|e| (e.event.timestamp, e.arrival) <= (event.timestamp, arrival));
        self.entries.insert(pos, WindowEntry { arrival, event });

        while self.entries.len() > self.max_events {
            let victim = self.eviction_index();
            let evicted = self.entries.remove(victim);
            if let Some(id) = &evicted.event.event_id {
                self.seen_ids.remove(id);
            }
        }
    }

    /// Remember which event types belong to the baseline so that eviction
    /// drops noise before completed steps.
    pub fn track_baseline(&mut self, baseline: &Baseline) {
        if self.vocabulary.is_empty() {
            self.vocabulary = baseline.event_types().map(String::from).collect();
        }
    }

    /// Oldest noise event first. When only baseline events are left, the
    /// matched prefix (the first `matched` of them) is kept.
    fn eviction_index(&self) -> usize {
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| !self.vocabulary.contains(&e.event.event_type))
        {
            return i;
        }
        if self.matched < self.entries.len() {
            self.matched
        } else {
            0
        }
    }

    pub fn event_types(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.event.event_type.as_str())
            .collect()
    }

    /// Most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let start = self.entries.len().saturating_sub(limit);
        self.entries[start..].iter().map(|e| e.event.clone()).collect()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.entries.last().map(|e| &e.event)
    }

    /// Deviation of the window from the baseline, never behind the progress
    /// already recorded for this session.
    pub fn deviation(&self, baseline: &Baseline) -> DeviationSummary {
        deviation(&self.event_types(), baseline).at_least(baseline, self.matched)
    }

    /// Baseline steps matched at the last evaluation
    pub fn matched(&self) -> usize {
        self.matched
    }

    /// Record the latest match length. Returns the number of newly matched
    /// steps (zero when the user did not progress).
    pub fn update_progress(&mut self, matched: usize) -> usize {
        let advanced = matched.saturating_sub(self.matched);
        self.matched = self.matched.max(matched);
        advanced
    }

    /// Event ids currently held for duplicate detection
    pub fn tracked_ids(&self) -> usize {
        self.seen_ids.len()
    }

    pub fn has_fired(&self, stuck_point: &str) -> bool {
        self.fired.contains(stuck_point)
    }

    pub fn mark_fired(&mut self, stuck_point: &str) {
        self.fired.insert(stuck_point.to_string());
    }

    /// Allow a new trigger for this stuck point. Returns whether it was armed off.
    pub fn rearm(&mut self, stuck_point: &str) -> bool {
        self.fired.remove(stuck_point)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut fired: Vec<String> = self.fired.iter().cloned().collect();
        fired.sort();
        SessionSnapshot {
            session: self.session.clone(),
            last_event: self.last_event().map(|e| e.event_type.clone()),
            fired_stuck_points: fired,
            baseline_progress: self.matched,
        }
    }
}
