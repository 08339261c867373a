//! Nudge engine orchestrator
//!
//! Drives one trigger cycle per `(user_id, stuck_point)`:
//!
//! ```text
//! trigger → diagnose → route ─┬─ abort (low confidence / capability failure)
//!                             └─ coach → persist nudge → count ─┬─ dispatch
//!                                                              └─ escalate + dispatch
//! ```
//!
//! Cycles for different keys run concurrently; a per-key async mutex keeps
//! at most one cycle in flight for the same key. The tracker lock is a plain
//! `std::sync::Mutex` and is never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use coordination::config::{CompanyConfig, CompanyDirectory};
use coordination::error::{CapabilityKind, EngineError, EngineResult};
use coordination::escalation::{
    AbortReason, CycleOutcome, CyclePhase, CycleReport, CycleState, EscalationGate, StatusChange,
};
use coordination::events::{
    EngineEvent, EventFilter, FilteredReceiver, SessionEndReason, SharedEventBus,
};
use coordination::resilience::{CapabilityHealth, HealthLevel, RetryPolicy};
use coordination::router::{route, Route};
use coordination::state::{
    AlertDraft, CounterKey, Diagnosis, Escalation, EscalationStatus, Event, InMemoryCounterStore,
    Nudge, NudgeContent, NudgeStatus, Session, SharedCounterStore, DEFAULT_COUNTER_TTL_SECS,
};
use coordination::tracker::{SessionSnapshot, SessionTracker, TrackerConfig, TriggerSignal};

use crate::agents::CapabilitySet;
use crate::capability::{invoke_with_retry, AlertRequest, DiagnosisRequest, NudgeSummary};
use crate::config::EngineSettings;
use crate::directory::{BaselineStore, ConfigStore};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::prompts::{ALERT_NUDGE_HISTORY, PROMPT_VERSION};
use crate::sink::{AuditRecord, AuditSink};

/// Tunables that do not vary per company.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub tracker: TrackerConfig,
    pub retry: RetryPolicy,
    pub capability_timeout: Duration,
    /// Events handed to the diagnosis capability
    pub history_window: usize,
    pub dashboard_url: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            retry: RetryPolicy::default(),
            capability_timeout: Duration::from_secs(30),
            history_window: 30,
            dashboard_url: coordination::escalation::DEFAULT_DASHBOARD_URL.to_string(),
        }
    }
}

impl EngineOptions {
    /// Directory values, overridden by environment settings where set.
    pub fn from_settings(settings: &EngineSettings, directory: &CompanyDirectory) -> Self {
        let mut tracker = directory.tracker.clone();
        if let Some(idle) = settings.idle_threshold_secs {
            tracker.idle_threshold_secs = idle;
        }
        if let Some(timeout) = settings.session_timeout_secs {
            tracker.session_timeout_secs = timeout;
        }
        Self {
            tracker,
            retry: settings.retry.clone(),
            capability_timeout: settings.capability_timeout,
            history_window: settings.history_window,
            dashboard_url: settings
                .dashboard_url
                .clone()
                .unwrap_or_else(|| directory.dashboard_url.clone()),
        }
    }
}

/// External collaborators of the engine.
#[derive(Clone)]
pub struct EngineParts {
    pub capabilities: CapabilitySet,
    pub baselines: Arc<dyn BaselineStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub dispatcher: Dispatcher,
    pub audit: Arc<dyn AuditSink>,
    pub counters: SharedCounterStore,
    pub bus: SharedEventBus,
}

impl EngineParts {
    /// Parts with an in-process counter store and a fresh event bus.
    pub fn new(
        capabilities: CapabilitySet,
        baselines: Arc<dyn BaselineStore>,
        configs: Arc<dyn ConfigStore>,
        dispatcher: Dispatcher,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            capabilities,
            baselines,
            configs,
            dispatcher,
            audit,
            counters: InMemoryCounterStore::new().shared(),
            bus: coordination::events::EventBus::new().shared(),
        }
    }
}

struct EngineInner {
    options: EngineOptions,
    parts: EngineParts,
    tracker: Mutex<SessionTracker>,
    gate: EscalationGate,
    cycle_locks: Mutex<HashMap<CounterKey, Arc<tokio::sync::Mutex<()>>>>,
    health: Mutex<HashMap<CapabilityKind, CapabilityHealth>>,
    /// Companies whose baseline lookup already succeeded
    loaded_baselines: Mutex<HashSet<String>>,
    tasks: TaskTracker,
}

/// Cheaply cloneable handle to the engine.
#[derive(Clone)]
pub struct NudgeEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NudgeEngine {
    pub fn new(parts: EngineParts, options: EngineOptions) -> EngineResult<Self> {
        let tracker = SessionTracker::new(options.tracker.clone())?;
        let gate =
            EscalationGate::new(Arc::clone(&parts.counters)).with_dashboard_url(&options.dashboard_url);
        Ok(Self {
            inner: Arc::new(EngineInner {
                options,
                parts,
                tracker: Mutex::new(tracker),
                gate,
                cycle_locks: Mutex::new(HashMap::new()),
                health: Mutex::new(HashMap::new()),
                loaded_baselines: Mutex::new(HashSet::new()),
                tasks: TaskTracker::new(),
            }),
        })
    }

    fn tracker(&self) -> MutexGuard<'_, SessionTracker> {
        lock(&self.inner.tracker)
    }

    fn publish(&self, event: EngineEvent) {
        self.inner.parts.bus.publish(event);
    }

    async fn audit(&self, record: AuditRecord) {
        if let Err(e) = self.inner.parts.audit.append(record).await {
            warn!(error = %e, "Audit record dropped");
        }
    }

    // ── Event intake ─────────────────────────────────────────────────

    /// Record one event and start a cycle if it fires a trigger.
    pub async fn ingest(&self, event: Event) -> Option<JoinHandle<CycleReport>> {
        let signal = self.handle_event(event).await?;
        Some(self.spawn_cycle(signal))
    }

    /// Record one event and return the trigger it fired, without running a
    /// cycle.
    pub async fn handle_event(&self, event: Event) -> Option<TriggerSignal> {
        self.ensure_baseline(&event.company_id).await;

        let user_id = event.user_id.clone();
        let session_id = event.session_id.clone();
        let company_id = event.company_id.clone();
        let timestamp = event.timestamp;

        let obs = self.tracker().observe(event);
        if obs.duplicate {
            return None;
        }

        if let Some(previous) = obs.superseded_session {
            self.publish(EngineEvent::SessionClosed {
                user_id: user_id.clone(),
                session_id: previous,
                reason: SessionEndReason::Superseded,
                timestamp,
            });
        }
        if obs.session_created {
            self.publish(EngineEvent::SessionStarted {
                user_id: user_id.clone(),
                session_id: session_id.clone(),
                company_id,
                timestamp,
            });
        }
        if let Some(cleared) = obs.cleared_stuck_point {
            self.record_progress(&user_id, &session_id, &cleared, timestamp);
        }

        obs.trigger
    }

    async fn ensure_baseline(&self, company_id: &str) {
        if lock(&self.inner.loaded_baselines).contains(company_id) {
            return;
        }
        match self.inner.parts.baselines.active_baseline(company_id).await {
            Ok(Some(baseline)) => {
                info!(company_id, steps = baseline.event_sequence.len(), "Baseline loaded");
                self.tracker().set_baseline(baseline);
                lock(&self.inner.loaded_baselines).insert(company_id.to_string());
            }
            Ok(None) => {
                debug!(company_id, "No active baseline; stuck signals only");
                lock(&self.inner.loaded_baselines).insert(company_id.to_string());
            }
            Err(e) => warn!(company_id, error = %e, "Baseline lookup failed; will retry"),
        }
    }

    /// The user advanced past a stuck point: reset its counter.
    fn record_progress(
        &self,
        user_id: &str,
        session_id: &str,
        stuck_point: &str,
        timestamp: DateTime<Utc>,
    ) {
        match self.inner.gate.resolve(user_id, stuck_point) {
            Ok(cleared) => {
                if cleared > 0 {
                    info!(user_id, stuck_point, cleared, "User progressed; nudge counter reset");
                }
                self.tracker().rearm_user(user_id, stuck_point);
            }
            Err(e) => warn!(user_id, stuck_point, error = %e, "Counter reset failed"),
        }
        self.publish(EngineEvent::ProgressRecorded {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            stuck_point: stuck_point.to_string(),
            timestamp,
        });
    }

    /// Check idle sessions and close timed-out ones, spawning a cycle per
    /// idle trigger.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<JoinHandle<CycleReport>> {
        let (report, closed) = {
            let mut tracker = self.tracker();
            let report = tracker.sweep(now);
            let closed: Vec<(String, String)> = report
                .closed_sessions
                .iter()
                .filter_map(|id| tracker.session(id).map(|s| (s.user_id.clone(), id.clone())))
                .collect();
            tracker.prune_closed();
            (report, closed)
        };
        self.prune_bookkeeping(now);

        for (user_id, session_id) in closed {
            self.publish(EngineEvent::SessionClosed {
                user_id,
                session_id,
                reason: SessionEndReason::Timeout,
                timestamp: now,
            });
        }

        report
            .triggers
            .into_iter()
            .map(|signal| self.spawn_cycle(signal))
            .collect()
    }

    /// Drop stale nudge entries and expired counters.
    fn prune_bookkeeping(&self, now: DateTime<Utc>) {
        let stale_age = chrono::Duration::seconds(DEFAULT_COUNTER_TTL_SECS);
        let nudges = self.inner.gate.prune_stale(now, stale_age);
        let counters = match self.inner.parts.counters.purge_expired(now) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Counter purge failed");
                0
            }
        };
        if nudges + counters > 0 {
            debug!(nudges, counters, "Engine bookkeeping pruned");
        }
    }

    // ── Cycle ────────────────────────────────────────────────────────

    pub fn spawn_cycle(&self, signal: TriggerSignal) -> JoinHandle<CycleReport> {
        let engine = self.clone();
        self.inner
            .tasks
            .spawn(async move { engine.run_cycle(signal).await })
    }

    fn cycle_lock(&self, key: &CounterKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.inner.cycle_locks).entry(key.clone()).or_default())
    }

    fn release_cycle_lock(&self, key: &CounterKey) {
        let mut locks = lock(&self.inner.cycle_locks);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Run one full cycle for a trigger. Never fails; the outcome is in the
    /// report.
    pub async fn run_cycle(&self, signal: TriggerSignal) -> CycleReport {
        let key = CounterKey::new(signal.user_id.clone(), signal.stuck_point.clone());
        let cycle_lock = self.cycle_lock(&key);
        let report = {
            let _guard = cycle_lock.lock().await;

            self.publish(EngineEvent::TriggerFired {
                user_id: signal.user_id.clone(),
                session_id: signal.session_id.clone(),
                stuck_point: signal.stuck_point.clone(),
                kind: signal.kind.clone(),
                timestamp: signal.detected_at,
            });

            let mut cycle = CycleState::new(key.clone());
            let outcome = match self.drive(&mut cycle, &signal).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(key = %key, error = %e, "Cycle stopped on an internal error");
                    CycleOutcome::Aborted {
                        reason: AbortReason::MissingContext {
                            message: e.to_string(),
                        },
                    }
                }
            };

            if let CycleOutcome::Aborted { reason } = &outcome {
                if reason.is_capability_failure() {
                    self.tracker().rearm(&signal.session_id, &signal.stuck_point);
                }
                self.publish(EngineEvent::CycleAborted {
                    user_id: signal.user_id.clone(),
                    session_id: signal.session_id.clone(),
                    stuck_point: signal.stuck_point.clone(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                });
            }
            cycle.finish(outcome)
        };
        drop(cycle_lock);
        self.release_cycle_lock(&key);

        self.audit(AuditRecord::Cycle {
            report: report.clone(),
        })
        .await;
        report
    }

    async fn drive(
        &self,
        cycle: &mut CycleState,
        signal: &TriggerSignal,
    ) -> EngineResult<CycleOutcome> {
        cycle.advance(CyclePhase::Triggered)?;

        let config = match self.inner.parts.configs.company_config(&signal.company_id).await {
            Ok(config) => config,
            Err(e) => {
                cycle.advance(CyclePhase::Aborted)?;
                return Ok(aborted(AbortReason::MissingContext {
                    message: e.to_string(),
                }));
            }
        };

        // Diagnose
        cycle.advance(CyclePhase::Diagnosing)?;
        let Some(request) = self.diagnosis_request(signal) else {
            cycle.advance(CyclePhase::Aborted)?;
            return Ok(aborted(AbortReason::MissingContext {
                message: format!("session {} is no longer tracked", signal.session_id),
            }));
        };
        let diagnosis = match self.diagnose(&request).await {
            Ok(d) => d,
            Err(e) => {
                warn!(user_id = %signal.user_id, stuck_point = %signal.stuck_point, error = %e, "Diagnosis failed; cycle aborted");
                cycle.advance(CyclePhase::Aborted)?;
                return Ok(aborted(AbortReason::from_error(CyclePhase::Diagnosing, &e)));
            }
        };
        let diagnosis = anchor_stuck_point(diagnosis, &signal.stuck_point);
        info!(
            user_id = %diagnosis.user_id,
            stuck_point = %diagnosis.stuck_point,
            confidence = diagnosis.confidence_score,
            "Diagnosis recorded"
        );
        self.publish(EngineEvent::DiagnosisRecorded {
            user_id: diagnosis.user_id.clone(),
            session_id: diagnosis.session_id.clone(),
            stuck_point: diagnosis.stuck_point.clone(),
            confidence: diagnosis.confidence_score,
            timestamp: diagnosis.created_at,
        });
        self.audit(AuditRecord::Diagnosis {
            company_id: signal.company_id.clone(),
            prompt_version: PROMPT_VERSION.to_string(),
            diagnosis: diagnosis.clone(),
        })
        .await;

        // Route
        if route(&diagnosis, config.confidence_threshold) == Route::Abort {
            info!(
                user_id = %diagnosis.user_id,
                stuck_point = %diagnosis.stuck_point,
                confidence = diagnosis.confidence_score,
                threshold = config.confidence_threshold,
                "Confidence below threshold; no nudge"
            );
            cycle.advance(CyclePhase::Aborted)?;
            return Ok(aborted(AbortReason::LowConfidence {
                confidence: diagnosis.confidence_score,
                threshold: config.confidence_threshold,
            }));
        }
        cycle.advance(CyclePhase::Routed)?;

        // Coach
        cycle.advance(CyclePhase::Coaching)?;
        let content = match self.coach(&diagnosis, &config).await {
            Ok(c) => c,
            Err(e) => {
                warn!(user_id = %diagnosis.user_id, stuck_point = %diagnosis.stuck_point, error = %e, "Nudge generation failed; cycle aborted");
                cycle.advance(CyclePhase::Aborted)?;
                return Ok(aborted(AbortReason::from_error(CyclePhase::Coaching, &e)));
            }
        };

        let nudge = Nudge::new(&signal.company_id, diagnosis.clone(), content);
        self.inner.gate.record_nudge(&nudge);
        self.audit(AuditRecord::Nudge {
            nudge: nudge.clone(),
        })
        .await;
        cycle.advance(CyclePhase::NudgeSent)?;

        // Count
        let key = cycle.key.clone();
        let count = match self.inner.gate.record_and_check(&key.user_id, &key.stuck_point) {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(key = %key, error = %e, "Counter unavailable; escalation check skipped");
                None
            }
        };
        cycle.advance(CyclePhase::Counted)?;
        info!(
            nudge_id = %nudge.nudge_id,
            user_id = %nudge.user_id,
            stuck_point = %nudge.stuck_point,
            nudge_type = %nudge.nudge_type,
            count = count.unwrap_or(0),
            "Nudge persisted"
        );
        self.publish(EngineEvent::NudgeSent {
            nudge_id: nudge.nudge_id.clone(),
            user_id: nudge.user_id.clone(),
            session_id: nudge.session_id.clone(),
            stuck_point: nudge.stuck_point.clone(),
            nudge_type: nudge.nudge_type,
            count: count.unwrap_or(0),
            timestamp: nudge.sent_at,
        });

        // Escalate
        let escalation = match count {
            Some(count)
                if self
                    .inner
                    .gate
                    .should_escalate(&key, count, config.escalation_threshold) =>
            {
                self.escalate(&config, &diagnosis, count).await
            }
            _ => None,
        };
        match &escalation {
            Some(_) => cycle.advance(CyclePhase::OpenEscalation)?,
            None => cycle.advance(CyclePhase::Idle)?,
        }

        // Dispatch
        let session_active = self.tracker().is_active(&nudge.session_id);
        let report = if session_active {
            self.inner
                .parts
                .dispatcher
                .dispatch(&nudge, escalation.as_ref())
                .await
        } else {
            info!(nudge_id = %nudge.nudge_id, session_id = %nudge.session_id, "Session closed mid-cycle; delivery suppressed");
            match &escalation {
                Some(e) => self.inner.parts.dispatcher.alert(e).await,
                None => DispatchReport::default(),
            }
        };
        self.publish_failures(&nudge.user_id, &report);

        let count = count.unwrap_or(0);
        Ok(match escalation {
            Some(escalation) => CycleOutcome::Escalated {
                nudge_id: nudge.nudge_id,
                count,
                escalation_id: escalation.escalation_id,
                delivered: report.delivered,
                delivery_suppressed: !session_active,
            },
            None => CycleOutcome::Nudged {
                nudge_id: nudge.nudge_id,
                count,
                delivered: report.delivered,
                delivery_suppressed: !session_active,
            },
        })
    }

    fn diagnosis_request(&self, signal: &TriggerSignal) -> Option<DiagnosisRequest> {
        let tracker = self.tracker();
        let session = tracker.session(&signal.session_id)?;
        let events = tracker.history(&signal.session_id, self.inner.options.history_window);
        Some(DiagnosisRequest {
            user_id: signal.user_id.clone(),
            session_id: signal.session_id.clone(),
            company_id: signal.company_id.clone(),
            stuck_point_hint: signal.stuck_point.clone(),
            trigger: signal.kind.to_string(),
            session_duration_minutes: session.duration_minutes(),
            last_event: events.last().map(|e| e.event_type.clone()),
            baseline_summary: tracker.baseline(&signal.company_id).map(|b| b.summary()),
            events,
        })
    }

    async fn diagnose(&self, request: &DiagnosisRequest) -> EngineResult<Diagnosis> {
        let capability = Arc::clone(&self.inner.parts.capabilities.diagnosis);
        let result = self
            .call(CapabilityKind::Diagnosis, || {
                let capability = Arc::clone(&capability);
                let request = request.clone();
                async move { capability.diagnose(&request).await }
            })
            .await
            .and_then(|v| Diagnosis::from_response(v, &request.user_id, &request.session_id));
        self.record_health(CapabilityKind::Diagnosis, &result);
        result
    }

    async fn coach(&self, diagnosis: &Diagnosis, config: &CompanyConfig) -> EngineResult<NudgeContent> {
        let capability = Arc::clone(&self.inner.parts.capabilities.coach);
        let result = self
            .call(CapabilityKind::Coach, || {
                let capability = Arc::clone(&capability);
                let diagnosis = diagnosis.clone();
                let tone = config.tone.clone();
                async move { capability.generate_nudge(&diagnosis, &tone).await }
            })
            .await
            .and_then(NudgeContent::from_response);
        self.record_health(CapabilityKind::Coach, &result);
        result
    }

    async fn call<F, Fut>(&self, capability: CapabilityKind, call: F) -> EngineResult<Value>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EngineResult<Value>>,
    {
        invoke_with_retry(
            capability,
            &self.inner.options.retry,
            self.inner.options.capability_timeout,
            call,
        )
        .await
    }

    /// Draft the CSM alert and open the escalation. `None` when another
    /// cycle opened one first.
    async fn escalate(
        &self,
        config: &CompanyConfig,
        diagnosis: &Diagnosis,
        count: u32,
    ) -> Option<Escalation> {
        let key = CounterKey::new(diagnosis.user_id.clone(), diagnosis.stuck_point.clone());
        let request = AlertRequest {
            user_id: diagnosis.user_id.clone(),
            company_id: config.company_id.clone(),
            diagnosis: diagnosis.clone(),
            nudge_count: count,
            recent_nudges: self
                .inner
                .gate
                .recent_nudges(&key, ALERT_NUDGE_HISTORY)
                .iter()
                .map(NudgeSummary::from)
                .collect(),
        };

        let drafter = Arc::clone(&self.inner.parts.capabilities.alerts);
        let result = self
            .call(CapabilityKind::AlertDrafting, || {
                let drafter = Arc::clone(&drafter);
                let request = request.clone();
                async move { drafter.draft_alert(&request).await }
            })
            .await
            .and_then(AlertDraft::from_response);
        self.record_health(CapabilityKind::AlertDrafting, &result);
        let draft = result.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Alert drafting failed; using fallback draft");
            AlertDraft::fallback(
                &diagnosis.user_id,
                &diagnosis.stuck_point,
                &diagnosis.inferred_reason,
                count,
            )
        });

        let escalation =
            self.inner
                .gate
                .open_escalation(&config.company_id, diagnosis, count, Some(draft))?;
        self.publish(EngineEvent::EscalationOpened {
            escalation_id: escalation.escalation_id.clone(),
            user_id: escalation.user_id.clone(),
            stuck_point: escalation.stuck_point.clone(),
            nudge_count: count,
            timestamp: escalation.created_at,
        });
        self.audit(AuditRecord::Escalation {
            escalation: escalation.clone(),
        })
        .await;
        Some(escalation)
    }

    fn record_health<T>(&self, capability: CapabilityKind, result: &EngineResult<T>) {
        let change = {
            let mut health = lock(&self.inner.health);
            let entry = health
                .entry(capability)
                .or_insert_with(|| CapabilityHealth::new(capability));
            match result {
                Ok(_) => entry.record_success(),
                Err(e) => entry.record_failure(&e.to_string()),
            }
        };
        if let Some(level) = change {
            match level {
                HealthLevel::Healthy => info!(%capability, "Capability recovered"),
                _ => warn!(%capability, ?level, "Capability health changed"),
            }
            self.publish(EngineEvent::CapabilityHealthChanged {
                capability,
                level,
                timestamp: Utc::now(),
            });
        }
    }

    fn publish_failures(&self, user_id: &str, report: &DispatchReport) {
        for failure in &report.failures {
            let (target, message) = match failure {
                EngineError::DeliveryUnavailable { target, message } => {
                    (target.clone(), message.clone())
                }
                other => (user_id.to_string(), other.to_string()),
            };
            self.publish(EngineEvent::DeliveryFailed {
                user_id: user_id.to_string(),
                target,
                message,
                timestamp: Utc::now(),
            });
        }
    }

    // ── Status hooks ─────────────────────────────────────────────────

    /// Client acknowledgment for a nudge.
    pub async fn update_nudge_status(
        &self,
        nudge_id: &str,
        status: NudgeStatus,
    ) -> EngineResult<NudgeStatus> {
        let previous = self.inner.gate.update_nudge_status(nudge_id, status)?;
        let user_id = self
            .inner
            .gate
            .nudge(nudge_id)
            .map(|n| n.key.user_id)
            .unwrap_or_default();
        self.publish(EngineEvent::NudgeStatusChanged {
            nudge_id: nudge_id.to_string(),
            user_id,
            status,
            timestamp: Utc::now(),
        });
        self.audit(AuditRecord::NudgeStatus {
            nudge_id: nudge_id.to_string(),
            from: previous,
            to: status,
            at: Utc::now(),
        })
        .await;
        Ok(previous)
    }

    /// CSM status change; closing an escalation re-arms the stuck point.
    pub async fn update_escalation_status(
        &self,
        escalation_id: &str,
        status: EscalationStatus,
    ) -> EngineResult<StatusChange> {
        let change = self.inner.gate.update_escalation_status(escalation_id, status)?;
        if change.released {
            let rearmed = self
                .tracker()
                .rearm_user(&change.escalation.user_id, &change.escalation.stuck_point);
            debug!(escalation_id, rearmed, "Stuck point re-armed after escalation closed");
        }
        self.publish(EngineEvent::EscalationStatusChanged {
            escalation_id: escalation_id.to_string(),
            user_id: change.escalation.user_id.clone(),
            from: change.previous,
            to: status,
            timestamp: Utc::now(),
        });
        self.audit(AuditRecord::EscalationStatus {
            escalation_id: escalation_id.to_string(),
            from: change.previous,
            to: status,
            at: Utc::now(),
        })
        .await;
        Ok(change)
    }

    /// Client closed the session explicitly.
    pub fn close_session(&self, session_id: &str) -> EngineResult<Session> {
        let session = self.tracker().close_session(session_id)?;
        self.publish(EngineEvent::SessionClosed {
            user_id: session.user_id.clone(),
            session_id: session.session_id.clone(),
            reason: SessionEndReason::Closed,
            timestamp: Utc::now(),
        });
        Ok(session)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.tracker().active_sessions()
    }

    pub fn open_escalations(&self) -> Vec<Escalation> {
        self.inner.gate.open_escalations()
    }

    pub fn gate(&self) -> &EscalationGate {
        &self.inner.gate
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.parts.bus.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        self.inner.parts.bus.subscribe_filtered(filter)
    }

    /// Capability health snapshots, ordered by capability name.
    pub fn health(&self) -> Vec<CapabilityHealth> {
        let mut out: Vec<CapabilityHealth> = lock(&self.inner.health).values().cloned().collect();
        out.sort_by_key(|h| h.capability.to_string());
        out
    }

    /// Wait for every spawned cycle to finish. New cycles can no longer be
    /// tracked afterwards.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

fn aborted(reason: AbortReason) -> CycleOutcome {
    CycleOutcome::Aborted { reason }
}

/// Counter keys follow the tracker's stuck point, not the model's wording.
fn anchor_stuck_point(mut diagnosis: Diagnosis, stuck_point: &str) -> Diagnosis {
    if diagnosis.stuck_point != stuck_point {
        debug!(
            reported = %diagnosis.stuck_point,
            anchored = stuck_point,
            "Diagnosis stuck point anchored to trigger"
        );
        diagnosis.stuck_point = stuck_point.to_string();
    }
    diagnosis
}
