//! End-to-end engine scenarios with hand-written capability and channel fakes

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use coordination::config::{CompanyConfig, CompanyDirectory, ToneConfig};
use coordination::error::{CapabilityKind, EngineError, EngineResult};
use coordination::escalation::CycleOutcome;
use coordination::resilience::RetryPolicy;
use coordination::state::{Baseline, CounterKey, Diagnosis, Escalation, Event};
use nudge_agents::capability::{AlertRequest, DiagnosisRequest};
use nudge_agents::{
    AlertChannel, AlertDrafter, AuditSink, CapabilitySet, CoachCapability, DeliveryChannel,
    DiagnosisCapability, DirectoryStore, Dispatcher, EngineOptions, EngineParts, JsonlAuditSink,
    MemoryAuditSink, NudgeEngine, NudgePayload,
};

// ── Fakes ────────────────────────────────────────────────────────────

struct FakeDiagnosis {
    confidence: f64,
    fail: bool,
    delay: StdDuration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl FakeDiagnosis {
    fn new(confidence: f64) -> Self {
        Self {
            confidence,
            fail: false,
            delay: StdDuration::ZERO,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0.0)
        }
    }

    fn slow(confidence: f64, delay: StdDuration) -> Self {
        Self {
            delay,
            ..Self::new(confidence)
        }
    }
}

#[async_trait]
impl DiagnosisCapability for FakeDiagnosis {
    async fn diagnose(&self, request: &DiagnosisRequest) -> EngineResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(EngineError::unavailable(
                CapabilityKind::Diagnosis,
                "connection refused",
            ));
        }
        Ok(json!({
            "stuck_point": request.stuck_point_hint,
            "inferred_reason": "Hovered over the invite button without clicking",
            "confidence_score": self.confidence,
        }))
    }
}

#[derive(Default)]
struct FakeCoach {
    tones: Mutex<Vec<ToneConfig>>,
}

#[async_trait]
impl CoachCapability for FakeCoach {
    async fn generate_nudge(&self, diagnosis: &Diagnosis, tone: &ToneConfig) -> EngineResult<Value> {
        self.tones.lock().unwrap().push(tone.clone());
        Ok(json!({
            "nudge_type": "in_app_chat",
            "content": format!("Need a hand with {}? It only takes a minute.", diagnosis.stuck_point),
            "target_element_id": null,
        }))
    }
}

struct FakeDrafter;

#[async_trait]
impl AlertDrafter for FakeDrafter {
    async fn draft_alert(&self, request: &AlertRequest) -> EngineResult<Value> {
        Ok(json!({
            "subject": format!("Alert: {} needs help", request.user_id),
            "body": format!("{} nudges sent without progress.", request.nudge_count),
            "priority": "high",
        }))
    }
}

#[derive(Default)]
struct RecordingDelivery {
    fail: bool,
    delivered: Mutex<Vec<(String, NudgePayload)>>,
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn deliver(&self, user_id: &str, payload: &NudgePayload) -> EngineResult<()> {
        if self.fail {
            return Err(EngineError::DeliveryUnavailable {
                target: user_id.to_string(),
                message: "socket closed".into(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((user_id.to_string(), payload.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAlerts {
    alerts: Mutex<Vec<Escalation>>,
}

#[async_trait]
impl AlertChannel for RecordingAlerts {
    async fn alert(&self, escalation: &Escalation) -> EngineResult<()> {
        self.alerts.lock().unwrap().push(escalation.clone());
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct World {
    engine: NudgeEngine,
    diagnosis: Arc<FakeDiagnosis>,
    coach: Arc<FakeCoach>,
    delivery: Arc<RecordingDelivery>,
    alerts: Arc<RecordingAlerts>,
    audit: Arc<MemoryAuditSink>,
}

fn directory() -> CompanyDirectory {
    let mut directory = CompanyDirectory::new();
    let mut company = CompanyConfig::new("acme");
    company.tone.voice = "playful".into();
    company.tone.emoji = true;
    directory.insert_company(company).unwrap();
    directory
        .insert_baseline(Baseline::from_event_types(
            "acme",
            ["signup", "create_project", "invite_team"],
        ))
        .unwrap();
    directory
}

fn world_with(
    diagnosis: FakeDiagnosis,
    delivery: RecordingDelivery,
    audit: Option<Arc<dyn AuditSink>>,
) -> World {
    let diagnosis = Arc::new(diagnosis);
    let coach = Arc::new(FakeCoach::default());
    let delivery = Arc::new(delivery);
    let alerts = Arc::new(RecordingAlerts::default());
    let memory = Arc::new(MemoryAuditSink::new());
    let store = Arc::new(DirectoryStore::new(directory()));

    let parts = EngineParts::new(
        CapabilitySet {
            diagnosis: diagnosis.clone(),
            coach: coach.clone(),
            alerts: Arc::new(FakeDrafter),
        },
        store.clone(),
        store,
        Dispatcher::new(delivery.clone(), alerts.clone()),
        audit.unwrap_or_else(|| memory.clone()),
    );
    let options = EngineOptions {
        retry: RetryPolicy::none(),
        capability_timeout: StdDuration::from_secs(5),
        ..EngineOptions::default()
    };
    World {
        engine: NudgeEngine::new(parts, options).unwrap(),
        diagnosis,
        coach,
        delivery,
        alerts,
        audit: memory,
    }
}

fn world(confidence: f64) -> World {
    world_with(FakeDiagnosis::new(confidence), RecordingDelivery::default(), None)
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::seconds(secs)
}

fn ev(user: &str, session: &str, event_type: &str, secs: i64) -> Event {
    Event::new(user, session, "acme", event_type, t(secs))
}

/// Signup followed by a help click in a fresh session; returns the cycle outcome.
async fn stuck_session(engine: &NudgeEngine, user: &str, session: &str, at: i64) -> CycleOutcome {
    assert!(engine.ingest(ev(user, session, "signup", at)).await.is_none());
    let handle = engine
        .ingest(ev(user, session, "help_click", at + 5).with_target("new-project-button"))
        .await
        .expect("help click fires a trigger");
    handle.await.unwrap().outcome
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_low_confidence_produces_no_nudge() {
    let w = world(0.4);
    let outcome = stuck_session(&w.engine, "u1", "s1", 0).await;

    assert!(outcome.is_aborted());
    assert!(w.delivery.delivered.lock().unwrap().is_empty());
    assert!(w.coach.tones.lock().unwrap().is_empty());
    assert_eq!(w.audit.count_kind("nudge"), 0);
    assert_eq!(
        w.engine
            .gate()
            .current_count(&CounterKey::new("u1", "create_project"))
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_capability_failure_leaves_no_trace_in_counters() {
    let w = world_with(FakeDiagnosis::failing(), RecordingDelivery::default(), None);
    let outcome = stuck_session(&w.engine, "u1", "s1", 0).await;

    assert!(outcome.is_aborted());
    assert_eq!(w.audit.count_kind("nudge"), 0);
    assert_eq!(w.audit.count_kind("cycle"), 1);
    assert_eq!(
        w.engine
            .gate()
            .current_count(&CounterKey::new("u1", "create_project"))
            .unwrap(),
        0
    );
    assert!(w.engine.open_escalations().is_empty());
}

#[tokio::test]
async fn test_repeated_sessions_escalate_exactly_once() {
    let w = world(0.9);
    let mut outcomes = Vec::new();
    for (i, session) in ["s1", "s2", "s3", "s4", "s5"].iter().enumerate() {
        outcomes.push(stuck_session(&w.engine, "u1", session, i as i64 * 600).await);
    }

    let counts: Vec<u32> = outcomes.iter().filter_map(CycleOutcome::count).collect();
    assert_eq!(counts, vec![1, 2, 3, 4, 5]);
    assert!(matches!(outcomes[3], CycleOutcome::Escalated { count: 4, .. }));
    assert!(matches!(outcomes[4], CycleOutcome::Nudged { count: 5, .. }));

    let alerts = w.alerts.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].nudge_count, 4);
    assert!(alerts[0].deep_link.ends_with(&alerts[0].escalation_id));
    assert_eq!(
        alerts[0].alert.as_ref().map(|a| a.subject.as_str()),
        Some("Alert: u1 needs help")
    );

    // every nudge, including the escalating one, reached the user
    assert_eq!(w.delivery.delivered.lock().unwrap().len(), 5);
    assert_eq!(w.audit.count_kind("escalation"), 1);
}

#[tokio::test]
async fn test_company_tone_reaches_the_coach() {
    let w = world(0.9);
    stuck_session(&w.engine, "u1", "s1", 0).await;
    let tones = w.coach.tones.lock().unwrap();
    assert_eq!(tones.len(), 1);
    assert_eq!(tones[0].voice, "playful");
    assert!(tones[0].emoji);
}

#[tokio::test]
async fn test_delivery_failure_keeps_the_nudge() {
    let w = world_with(
        FakeDiagnosis::new(0.9),
        RecordingDelivery {
            fail: true,
            ..Default::default()
        },
        None,
    );
    let mut events = w.engine.subscribe();

    let outcome = stuck_session(&w.engine, "u1", "s1", 0).await;
    assert!(matches!(
        outcome,
        CycleOutcome::Nudged {
            count: 1,
            delivered: false,
            ..
        }
    ));
    assert_eq!(w.audit.count_kind("nudge"), 1);

    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type() == "delivery_failed" {
            failed += 1;
        }
    }
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_idle_sweep_nudges_next_baseline_step() {
    let w = world(0.8);
    w.engine.ingest(ev("u1", "s1", "signup", 0)).await;
    w.engine.ingest(ev("u1", "s1", "page_view", 10)).await;
    w.engine.ingest(ev("u1", "s1", "create_project", 20)).await;

    let handles = w.engine.sweep(t(200));
    assert_eq!(handles.len(), 1);
    let report = handles.into_iter().next().unwrap().await.unwrap();
    assert_eq!(report.key.stuck_point, "invite_team");

    let delivered = w.delivery.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1.stuck_point, "invite_team");
}

#[tokio::test]
async fn test_progress_resets_counter_between_sessions() {
    let w = world(0.9);
    stuck_session(&w.engine, "u1", "s1", 0).await;
    stuck_session(&w.engine, "u1", "s2", 600).await;
    let key = CounterKey::new("u1", "create_project");
    assert_eq!(w.engine.gate().current_count(&key).unwrap(), 2);

    w.engine.ingest(ev("u1", "s2", "create_project", 700)).await;
    assert_eq!(w.engine.gate().current_count(&key).unwrap(), 0);
}

#[tokio::test]
async fn test_cycles_for_one_key_are_serialized() {
    let w = world_with(
        FakeDiagnosis::slow(0.9, StdDuration::from_millis(30)),
        RecordingDelivery::default(),
        None,
    );
    w.engine.ingest(ev("u1", "s1", "signup", 0)).await;
    let signal = w
        .engine
        .handle_event(ev("u1", "s1", "help_click", 5))
        .await
        .unwrap();

    let a = w.engine.spawn_cycle(signal.clone());
    let b = w.engine.spawn_cycle(signal);
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(w.diagnosis.max_in_flight.load(Ordering::SeqCst), 1);
    let mut counts = vec![a.outcome.count().unwrap(), b.outcome.count().unwrap()];
    counts.sort();
    assert_eq!(counts, vec![1, 2]);
}

#[tokio::test]
async fn test_cycles_for_different_users_run_in_parallel() {
    let w = world_with(
        FakeDiagnosis::slow(0.9, StdDuration::from_millis(50)),
        RecordingDelivery::default(),
        None,
    );
    let mut signals = Vec::new();
    for user in ["u1", "u2"] {
        w.engine.ingest(ev(user, &format!("{user}-s"), "signup", 0)).await;
        signals.push(
            w.engine
                .handle_event(ev(user, &format!("{user}-s"), "help_click", 5))
                .await
                .unwrap(),
        );
    }
    let handles: Vec<_> = signals
        .into_iter()
        .map(|s| w.engine.spawn_cycle(s))
        .collect();
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(w.diagnosis.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(w.diagnosis.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_jsonl_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let w = world_with(
        FakeDiagnosis::new(0.9),
        RecordingDelivery::default(),
        Some(Arc::new(JsonlAuditSink::new(&path))),
    );
    stuck_session(&w.engine, "u1", "s1", 0).await;
    w.engine.shutdown().await;

    let content = std::fs::read_to_string(&path).unwrap();
    let kinds: Vec<String> = content
        .lines()
        .map(|l| {
            let v: Value = serde_json::from_str(l).unwrap();
            v["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["diagnosis", "nudge", "cycle"]);
}
