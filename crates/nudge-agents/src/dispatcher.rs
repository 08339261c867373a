//! Delivery Dispatcher
//!
//! Routes nudges to the live delivery channel and escalations to the CSM
//! alert channel. It makes no decisions: a failed delivery is logged and
//! reported back in a [`DispatchReport`], and the persisted nudge stays
//! `sent`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use coordination::error::{EngineError, EngineResult};
use coordination::state::{AlertDraft, Escalation, Nudge, NudgeId, NudgeType, UserId};

/// Per-connection buffer of undelivered nudges
const CONNECTION_BUFFER: usize = 32;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the client SDK receives for one nudge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NudgePayload {
    pub nudge_id: NudgeId,
    pub nudge_type: NudgeType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_id: Option<String>,
    pub stuck_point: String,
    pub sent_at: DateTime<Utc>,
}

impl From<&Nudge> for NudgePayload {
    fn from(nudge: &Nudge) -> Self {
        Self {
            nudge_id: nudge.nudge_id.clone(),
            nudge_type: nudge.nudge_type,
            content: nudge.content.clone(),
            target_element_id: nudge.target_element_id.clone(),
            stuck_point: nudge.stuck_point.clone(),
            sent_at: nudge.sent_at,
        }
    }
}

/// Live path to the end user.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, user_id: &str, payload: &NudgePayload) -> EngineResult<()>;
}

/// Notification path to the CSM team.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn alert(&self, escalation: &Escalation) -> EngineResult<()>;
}

/// Open client connections, one sender per user.
///
/// A newer connection for the same user replaces the older one.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    senders: Mutex<HashMap<UserId, mpsc::Sender<NudgePayload>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, mpsc::Sender<NudgePayload>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a user connection; nudges arrive on the returned receiver.
    pub fn connect(&self, user_id: &str) -> mpsc::Receiver<NudgePayload> {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        if self.lock().insert(user_id.to_string(), tx).is_some() {
            debug!(user_id, "Replaced existing connection");
        }
        info!(user_id, "Client connected");
        rx
    }

    pub fn disconnect(&self, user_id: &str) -> bool {
        let removed = self.lock().remove(user_id).is_some();
        if removed {
            info!(user_id, "Client disconnected");
        }
        removed
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.lock().get(user_id).is_some_and(|tx| !tx.is_closed())
    }

    /// Users with a live connection, sorted.
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .lock()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }
}

#[async_trait]
impl DeliveryChannel for ConnectionRegistry {
    async fn deliver(&self, user_id: &str, payload: &NudgePayload) -> EngineResult<()> {
        let unavailable = |message: &str| EngineError::DeliveryUnavailable {
            target: user_id.to_string(),
            message: message.to_string(),
        };

        let mut senders = self.lock();
        let tx = senders
            .get(user_id)
            .ok_or_else(|| unavailable("user not connected"))?;
        match tx.try_send(payload.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(unavailable("connection buffer full")),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                senders.remove(user_id);
                Err(unavailable("connection closed"))
            }
        }
    }
}

/// Delivery channel for headless workers: every nudge is logged as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeliveryChannel;

#[async_trait]
impl DeliveryChannel for LogDeliveryChannel {
    async fn deliver(&self, user_id: &str, payload: &NudgePayload) -> EngineResult<()> {
        let json = serde_json::to_string(payload).map_err(|e| EngineError::DeliveryUnavailable {
            target: user_id.to_string(),
            message: e.to_string(),
        })?;
        info!(user_id, nudge = %json, "Nudge ready for delivery");
        Ok(())
    }
}

/// Slack-compatible incoming webhook.
///
/// Delivery is fire-and-forget: `alert` returns once the request is spawned
/// and the outcome is only logged.
#[derive(Debug, Clone)]
pub struct WebhookAlertChannel {
    url: String,
    http: reqwest::Client,
}

impl WebhookAlertChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }
}

/// Slack message body for an escalation.
pub fn slack_payload(escalation: &Escalation) -> Value {
    let draft = escalation.alert.clone().unwrap_or_else(|| {
        AlertDraft::fallback(
            &escalation.user_id,
            &escalation.stuck_point,
            &escalation.inferred_reason,
            escalation.nudge_count,
        )
    });
    json!({
        "text": format!(
            "🚨 *{}*\n\n{}\n\n<{}|Open in dashboard>",
            draft.subject, draft.body, escalation.deep_link
        )
    })
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    async fn alert(&self, escalation: &Escalation) -> EngineResult<()> {
        let payload = slack_payload(escalation);
        let http = self.http.clone();
        let url = self.url.clone();
        let escalation_id = escalation.escalation_id.clone();
        tokio::spawn(async move {
            match http
                .post(&url)
                .json(&payload)
                .timeout(WEBHOOK_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(%escalation_id, status = %resp.status(), "CSM alert sent")
                }
                Ok(resp) => warn!(%escalation_id, status = %resp.status(), "CSM alert rejected"),
                Err(e) => warn!(%escalation_id, "CSM alert failed: {e}"),
            }
        });
        Ok(())
    }
}

/// Alert channel used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn alert(&self, escalation: &Escalation) -> EngineResult<()> {
        info!(
            escalation_id = %escalation.escalation_id,
            user_id = %escalation.user_id,
            stuck_point = %escalation.stuck_point,
            deep_link = %escalation.deep_link,
            "Escalation ready for CSM (no webhook configured)"
        );
        Ok(())
    }
}

/// Outcome of one dispatch; failures are non-fatal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub delivered: bool,
    pub alerted: bool,
    pub failures: Vec<EngineError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    delivery: Arc<dyn DeliveryChannel>,
    alerts: Arc<dyn AlertChannel>,
}

impl Dispatcher {
    pub fn new(delivery: Arc<dyn DeliveryChannel>, alerts: Arc<dyn AlertChannel>) -> Self {
        Self { delivery, alerts }
    }

    /// Send the nudge and, when escalating, alert the CSM team.
    pub async fn dispatch(&self, nudge: &Nudge, escalation: Option<&Escalation>) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.deliver_into(nudge, &mut report).await;
        if let Some(escalation) = escalation {
            self.alert_into(escalation, &mut report).await;
        }
        report
    }

    /// Alert the CSM team without touching the user.
    pub async fn alert(&self, escalation: &Escalation) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.alert_into(escalation, &mut report).await;
        report
    }

    async fn deliver_into(&self, nudge: &Nudge, report: &mut DispatchReport) {
        let payload = NudgePayload::from(nudge);
        match self.delivery.deliver(&nudge.user_id, &payload).await {
            Ok(()) => {
                report.delivered = true;
                debug!(nudge_id = %nudge.nudge_id, user_id = %nudge.user_id, "Nudge delivered");
            }
            Err(e) => {
                warn!(nudge_id = %nudge.nudge_id, user_id = %nudge.user_id, error = %e, "Nudge delivery failed");
                report.failures.push(e);
            }
        }
    }

    async fn alert_into(&self, escalation: &Escalation, report: &mut DispatchReport) {
        match self.alerts.alert(escalation).await {
            Ok(()) => report.alerted = true,
            Err(e) => {
                warn!(escalation_id = %escalation.escalation_id, error = %e, "CSM alert failed");
                report.failures.push(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::state::{Diagnosis, EscalationStatus, NudgeContent};

    fn nudge() -> Nudge {
        let diagnosis = Diagnosis {
            diagnosis_id: "d1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            stuck_point: "invite_team".into(),
            inferred_reason: "Cancelled the invite modal".into(),
            confidence_score: 0.8,
            created_at: Utc::now(),
        };
        Nudge::new(
            "acme",
            diagnosis,
            NudgeContent {
                nudge_type: NudgeType::Tooltip,
                content: "Click Invite to add a teammate".into(),
                target_element_id: Some("invite-btn".into()),
            },
        )
    }

    fn escalation() -> Escalation {
        Escalation {
            escalation_id: "e1".into(),
            user_id: "u1".into(),
            company_id: "acme".into(),
            stuck_point: "invite_team".into(),
            inferred_reason: "Cancelled the invite modal".into(),
            nudge_log: vec!["n1".into()],
            nudge_count: 4,
            status: EscalationStatus::Open,
            deep_link: "http://localhost:3000/escalations/e1".into(),
            alert: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_registry_delivers_to_connected_user() {
        let registry = ConnectionRegistry::new();
        let mut rx = registry.connect("u1");
        assert!(registry.is_connected("u1"));
        assert_eq!(registry.connected_users(), vec!["u1".to_string()]);

        let n = nudge();
        registry.deliver("u1", &NudgePayload::from(&n)).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.nudge_id, n.nudge_id);
        assert_eq!(received.target_element_id.as_deref(), Some("invite-btn"));
    }

    #[tokio::test]
    async fn test_registry_reports_missing_and_closed_connections() {
        let registry = ConnectionRegistry::new();
        let payload = NudgePayload::from(&nudge());
        let err = registry.deliver("u1", &payload).await.unwrap_err();
        assert_eq!(err.code(), "DELIVERY_UNAVAILABLE");

        let rx = registry.connect("u1");
        drop(rx);
        assert!(!registry.is_connected("u1"));
        assert!(registry.deliver("u1", &payload).await.is_err());
        assert!(!registry.disconnect("u1"), "closed sender is pruned on delivery");
    }

    #[test]
    fn test_slack_payload_uses_fallback_draft() {
        let payload = slack_payload(&escalation());
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("🚨 *Alert: User needs help with invite_team*"));
        assert!(text.contains("/escalations/e1"));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_not_fatal() {
        let mut delivery = MockDeliveryChannel::new();
        delivery.expect_deliver().times(1).returning(|user, _| {
            Err(EngineError::DeliveryUnavailable {
                target: user.to_string(),
                message: "user not connected".into(),
            })
        });
        let mut alerts = MockAlertChannel::new();
        alerts.expect_alert().times(1).returning(|_| Ok(()));

        let dispatcher = Dispatcher::new(Arc::new(delivery), Arc::new(alerts));
        let report = dispatcher.dispatch(&nudge(), Some(&escalation())).await;
        assert!(!report.delivered);
        assert!(report.alerted);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_no_alert_without_escalation() {
        let mut delivery = MockDeliveryChannel::new();
        delivery.expect_deliver().returning(|_, _| Ok(()));
        let mut alerts = MockAlertChannel::new();
        alerts.expect_alert().never();

        let dispatcher = Dispatcher::new(Arc::new(delivery), Arc::new(alerts));
        let report = dispatcher.dispatch(&nudge(), None).await;
        assert!(report.delivered && !report.alerted && report.is_clean());
    }
}
