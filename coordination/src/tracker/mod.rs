//! Session Tracker: per-session activity state and trigger detection
//!
//! The tracker is the single writer of session state. It never calls
//! external services; callers serialize access (the engine keeps it behind a
//! mutex that is never held across an await).
//!
//! # Trigger lifecycle per (session, stuck point)
//!
//! ```text
//! armed ──signal──▶ fired ──progress past stuck point──▶ armed
//!                     │
//!                     ├──rearm() (capability failure)──▶ armed
//!                     └──counter reset────────────────▶ armed
//! ```

pub mod friction;
pub mod session;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::baseline::DeviationSummary;
use crate::error::{EngineError, EngineResult};
use crate::state::{Baseline, CompanyId, Event, Session, SessionId, UserId};

pub use friction::{FrictionDetector, StuckSignature, TriggerKind, DEFAULT_STUCK_EVENT_TYPES};
pub use session::{SessionSnapshot, SessionWindow};

/// Configuration for the Session Tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Quiet period that counts as inactivity
    pub idle_threshold_secs: i64,
    /// Quiet period after which a session is closed
    pub session_timeout_secs: i64,
    /// Maximum events retained per session window
    pub max_window_events: usize,
    pub stuck_signatures: Vec<StuckSignature>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 120,
            session_timeout_secs: 3_600,
            max_window_events: 200,
            stuck_signatures: StuckSignature::defaults(),
        }
    }
}

/// Condition that should start a diagnosis cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSignal {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub company_id: CompanyId,
    pub stuck_point: String,
    pub kind: TriggerKind,
    /// Baseline comparison at detection time, when a baseline is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<DeviationSummary>,
    pub detected_at: DateTime<Utc>,
}

/// Everything the tracker learned from one event
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Event id was already recorded; nothing changed
    pub duplicate: bool,
    /// First event of a previously unknown session
    pub session_created: bool,
    /// Another session of the same user that was closed by this event
    pub superseded_session: Option<SessionId>,
    /// Stuck point the user progressed past with this event
    pub cleared_stuck_point: Option<String>,
    pub deviation: Option<DeviationSummary>,
    pub trigger: Option<TriggerSignal>,
}

/// Result of a periodic sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub triggers: Vec<TriggerSignal>,
    pub closed_sessions: Vec<SessionId>,
}

/// Session Tracker
pub struct SessionTracker {
    config: TrackerConfig,
    detector: FrictionDetector,
    sessions: HashMap<SessionId, SessionWindow>,
    active_by_user: HashMap<UserId, SessionId>,
    baselines: HashMap<CompanyId, Baseline>,
    arrivals: u64,
}

impl SessionTracker {
    pub fn new(config: TrackerConfig) -> EngineResult<Self> {
        if config.idle_threshold_secs <= 0 || config.session_timeout_secs <= 0 {
            return Err(EngineError::invalid_config(
                "idle threshold and session timeout must be positive",
            ));
        }
        let detector = FrictionDetector::new(
            &config.stuck_signatures,
            Duration::seconds(config.idle_threshold_secs),
        )?;
        Ok(Self {
            config,
            detector,
            sessions: HashMap::new(),
            active_by_user: HashMap::new(),
            baselines: HashMap::new(),
            arrivals: 0,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Cache the active baseline for a company. Inactive baselines are ignored.
    pub fn set_baseline(&mut self, baseline: Baseline) {
        if baseline.is_active {
            self.baselines.insert(baseline.company_id.clone(), baseline);
        } else {
            self.baselines.remove(&baseline.company_id);
        }
    }

    pub fn baseline(&self, company_id: &str) -> Option<&Baseline> {
        self.baselines.get(company_id)
    }

    pub fn has_baseline(&self, company_id: &str) -> bool {
        self.baselines.contains_key(company_id)
    }

    /// Record one event; returns a trigger signal when one fires.
    pub fn record_event(&mut self, event: Event) -> Option<TriggerSignal> {
        self.observe(event).trigger
    }

    /// Record one event and report everything it changed.
    pub fn observe(&mut self, event: Event) -> Observation {
        let mut obs = Observation::default();

        if self
            .sessions
            .get(&event.session_id)
            .is_some_and(|w| w.is_duplicate(&event))
        {
            debug!(session_id = %event.session_id, event_id = ?event.event_id, "Duplicate event ignored");
            obs.duplicate = true;
            return obs;
        }

        obs.superseded_session = self.claim_active_session(&event);

        let arrival = self.arrivals;
        self.arrivals += 1;

        let max_events = self.config.max_window_events;
        let window = self
            .sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| {
                obs.session_created = true;
                SessionWindow::new(&event, max_events)
            });

        let last_seen = (!obs.session_created && window.session.is_active)
            .then_some(window.session.last_seen_time);
        let kind = self.detector.detect(last_seen, &event);
        let fallback_stuck_point = event
            .target_element
            .clone()
            .unwrap_or_else(|| event.event_type.clone());

        if let Some(baseline) = self.baselines.get(&window.session.company_id) {
            window.track_baseline(baseline);
        }
        window.insert(event, arrival);

        let deviation = self
            .baselines
            .get(&window.session.company_id)
            .map(|b| window.deviation(b));

        if let Some(d) = &deviation {
            let previous = window.matched();
            if window.update_progress(d.matched) > 0 {
                if let Some(cleared) = self
                    .baselines
                    .get(&window.session.company_id)
                    .and_then(|b| b.event_sequence.get(previous))
                    .map(|s| s.event_type.clone())
                {
                    window.rearm(&cleared);
                    obs.cleared_stuck_point = Some(cleared);
                }
            }
        }

        // a gap that ends in progress is not inactivity on the next step
        let kind = kind.filter(|k| {
            obs.cleared_stuck_point.is_none() || !matches!(k, TriggerKind::Inactivity { .. })
        });

        let stuck_point = match &deviation {
            Some(d) => d.stuck_point.clone(),
            None if matches!(kind, Some(TriggerKind::StuckSignal { .. })) => {
                Some(fallback_stuck_point)
            }
            None => None,
        };

        if let (Some(kind), Some(stuck_point)) = (kind, stuck_point) {
            if window.has_fired(&stuck_point) {
                debug!(session_id = %window.session.session_id, %stuck_point, "Trigger already fired");
            } else {
                window.mark_fired(&stuck_point);
                let signal = TriggerSignal {
                    user_id: window.session.user_id.clone(),
                    session_id: window.session.session_id.clone(),
                    company_id: window.session.company_id.clone(),
                    stuck_point,
                    kind,
                    deviation: deviation.clone(),
                    detected_at: window.session.last_seen_time,
                };
                info!(
                    user_id = %signal.user_id,
                    session_id = %signal.session_id,
                    stuck_point = %signal.stuck_point,
                    trigger = %signal.kind,
                    "Trigger fired"
                );
                obs.trigger = Some(signal);
            }
        }

        obs.deviation = deviation;
        obs
    }

    /// Make the event's session the user's only active one.
    fn claim_active_session(&mut self, event: &Event) -> Option<SessionId> {
        let previous = self
            .active_by_user
            .insert(event.user_id.clone(), event.session_id.clone())?;
        if previous == event.session_id {
            return None;
        }
        let window = self.sessions.get_mut(&previous)?;
        if !window.session.is_active {
            return None;
        }
        window.session.is_active = false;
        info!(user_id = %event.user_id, session_id = %previous, "Session superseded by a newer session");
        Some(previous)
    }

    /// Detect inactivity without a new event and close timed-out sessions.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let timeout = Duration::seconds(self.config.session_timeout_secs);

        for window in self.sessions.values_mut() {
            if !window.session.is_active {
                continue;
            }
            let last_seen = window.session.last_seen_time;
            if now - last_seen > timeout {
                window.session.is_active = false;
                if self.active_by_user.get(&window.session.user_id)
                    == Some(&window.session.session_id)
                {
                    self.active_by_user.remove(&window.session.user_id);
                }
                info!(session_id = %window.session.session_id, "Session timed out");
                report.closed_sessions.push(window.session.session_id.clone());
                continue;
            }

            let Some(kind) = self.detector.detect_idle(last_seen, now) else {
                continue;
            };
            let Some(baseline) = self.baselines.get(&window.session.company_id) else {
                continue;
            };
            let deviation = window.deviation(baseline);
            let Some(stuck_point) = deviation.stuck_point.clone() else {
                continue;
            };
            if window.has_fired(&stuck_point) {
                continue;
            }
            window.mark_fired(&stuck_point);
            info!(
                user_id = %window.session.user_id,
                session_id = %window.session.session_id,
                %stuck_point,
                trigger = %kind,
                "Trigger fired by idle sweep"
            );
            report.triggers.push(TriggerSignal {
                user_id: window.session.user_id.clone(),
                session_id: window.session.session_id.clone(),
                company_id: window.session.company_id.clone(),
                stuck_point,
                kind,
                deviation: Some(deviation),
                detected_at: now,
            });
        }

        report.closed_sessions.sort();
        report
    }

    /// Explicitly end a session.
    pub fn close_session(&mut self, session_id: &str) -> EngineResult<Session> {
        let window = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        window.session.is_active = false;
        if self.active_by_user.get(&window.session.user_id).map(String::as_str) == Some(session_id)
        {
            self.active_by_user.remove(&window.session.user_id);
        }
        Ok(window.session.clone())
    }

    /// Allow the next qualifying signal for this stuck point to fire again.
    pub fn rearm(&mut self, session_id: &str, stuck_point: &str) -> bool {
        self.sessions
            .get_mut(session_id)
            .is_some_and(|w| w.rearm(stuck_point))
    }

    /// Re-arm every session of a user, used when the user's counter resets.
    pub fn rearm_user(&mut self, user_id: &str, stuck_point: &str) -> usize {
        self.sessions
            .values_mut()
            .filter(|w| w.session.user_id == user_id)
            .map(|w| w.rearm(stuck_point))
            .filter(|rearmed| *rearmed)
            .count()
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id).map(|w| &w.session)
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.session(session_id).is_some_and(|s| s.is_active)
    }

    pub fn active_session_for(&self, user_id: &str) -> Option<&SessionId> {
        self.active_by_user.get(user_id)
    }

    /// Most recent events of a session, oldest first.
    pub fn history(&self, session_id: &str, limit: usize) -> Vec<Event> {
        self.sessions
            .get(session_id)
            .map(|w| w.recent(limit))
            .unwrap_or_default()
    }

    /// Snapshots of all active sessions, newest activity first.
    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self
            .sessions
            .values()
            .filter(|w| w.session.is_active)
            .map(SessionWindow::snapshot)
            .collect();
        out.sort_by(|a, b| b.session.last_seen_time.cmp(&a.session.last_seen_time));
        out
    }

    /// Forget closed sessions. Returns how many were dropped.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, w| w.session.is_active);
        before - self.sessions.len()
    }
}
