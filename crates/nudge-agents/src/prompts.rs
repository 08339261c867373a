//! System prompts and user-prompt builders for each capability.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes
//! so audit records can be tied to the prompt that produced them.

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use coordination::config::ToneConfig;
use coordination::state::Diagnosis;

use crate::capability::{AlertRequest, DiagnosisRequest};

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Longest nudge excerpt quoted back to the alert drafter
const NUDGE_EXCERPT_CHARS: usize = 80;

/// Nudges quoted in an alert prompt
pub const ALERT_NUDGE_HISTORY: usize = 5;

pub const DIAGNOSIS_PREAMBLE: &str = "\
You are an expert user experience analyst for B2B SaaS products.

You analyze a user's onboarding event stream and compare it against the \
success baseline: the path successful users take.

Identify:
1. WHERE the user is stuck (the specific step or screen)
2. WHY they appear to be stuck, inferred from their behavior
3. How CONFIDENT you are, from 0.0 to 1.0

Behavioral signals to weigh:
- repeated visits to the same page without progression
- long inactivity on one step
- clicks on help, cancel or back
- interacting with elements without completing the action
- skipping expected baseline steps

If the user appears to be progressing normally, keep confidence_score below 0.3.

Respond with a single JSON object matching this schema:
";

pub const COACH_PREAMBLE: &str = "\
You are a friendly onboarding coach for a B2B SaaS product.

Write a SHORT nudge that guides a stuck user to their next step.

Rules:
1. At most 2 sentences for tooltips, 3 for chat messages.
2. Reference the exact feature or step the user is stuck on.
3. Be encouraging; never make the user feel bad for being stuck.
4. Match the tone settings you are given.
5. Suggest one concrete next action.

Choose nudge_type:
- tooltip: confusion about a specific UI element (set target_element_id)
- in_app_chat: general workflow confusion or multi-step guidance
- email_draft: only when the user has been away for more than 10 minutes

Respond with a single JSON object matching this schema:
";

pub const ALERT_PREAMBLE: &str = "\
You are a customer success assistant. A user is stuck and automated nudges \
have not helped.

Write a concise alert for a Customer Success Manager with a short summary of \
the problem, the nudges already tried and a recommended action. Stay \
professional and under 150 words.

Respond with a single JSON object matching this schema:
";

/// Diagnosis capability reply
#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
pub struct DiagnosisReply {
    /// Descriptive name of where the user is stuck
    pub stuck_point: String,
    /// Why the user appears stuck, based on their behavior
    pub inferred_reason: String,
    /// Confidence between 0.0 and 1.0
    pub confidence_score: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NudgeKind {
    Tooltip,
    InAppChat,
    EmailDraft,
}

/// Coach capability reply
#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
pub struct CoachReply {
    pub nudge_type: NudgeKind,
    /// The nudge text shown to the user
    pub content: String,
    /// Element to attach a tooltip to, or null
    pub target_element_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Alert drafting reply
#[derive(Debug, Deserialize, JsonSchema)]
#[allow(dead_code)]
pub struct AlertReply {
    /// e.g. "Alert: User needs help with <area>"
    pub subject: String,
    pub body: String,
    pub priority: Priority,
}

fn with_schema<T: JsonSchema>(preamble: &str) -> String {
    let schema = serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default();
    format!("{preamble}{schema}")
}

pub fn diagnosis_system_prompt() -> String {
    with_schema::<DiagnosisReply>(DIAGNOSIS_PREAMBLE)
}

pub fn coach_system_prompt() -> String {
    with_schema::<CoachReply>(COACH_PREAMBLE)
}

pub fn alert_system_prompt() -> String {
    with_schema::<AlertReply>(ALERT_PREAMBLE)
}

/// User prompt for the diagnosis capability.
pub fn diagnosis_prompt(request: &DiagnosisRequest) -> String {
    let events = request
        .events
        .iter()
        .map(|e| {
            format!(
                "[{}] {} on '{}' | properties: {}",
                e.timestamp.to_rfc3339(),
                e.event_type,
                e.target_element.as_deref().unwrap_or("unknown"),
                serde_json::Value::Object(e.properties.clone())
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Analyze this user's onboarding session:\n\n\
         **User ID:** {user}\n\
         **Session Duration:** {minutes} minutes\n\
         **Last Event:** {last}\n\
         **Trigger:** {trigger}\n\
         **Likely Stuck Step:** {hint}\n\n\
         **Success Baseline (expected path):**\n{baseline}\n\n\
         **User's Event Stream (most recent last):**\n{events}\n\n\
         Provide your diagnosis as JSON.",
        user = request.user_id,
        minutes = request.session_duration_minutes,
        last = request.last_event.as_deref().unwrap_or("unknown"),
        trigger = request.trigger,
        hint = request.stuck_point_hint,
        baseline = request
            .baseline_summary
            .as_deref()
            .unwrap_or("No baseline configured"),
        events = if events.is_empty() {
            "(no events)".to_string()
        } else {
            events
        },
    )
}

/// User prompt for the coach capability.
pub fn coach_prompt(diagnosis: &Diagnosis, tone: &ToneConfig) -> String {
    format!(
        "Generate a nudge for this stuck user:\n\n\
         **Diagnosis:**\n\
         - Stuck at: {stuck}\n\
         - Reason: {reason}\n\
         - Confidence: {confidence:.2}\n\n\
         **Tone Settings:** Voice: {voice}, Formality: {formality}, Use emoji: {emoji}\n\n\
         Generate the nudge as JSON.",
        stuck = diagnosis.stuck_point,
        reason = diagnosis.inferred_reason,
        confidence = diagnosis.confidence_score,
        voice = tone.voice,
        formality = tone.formality,
        emoji = if tone.emoji { "yes" } else { "no" },
    )
}

/// User prompt for the alert drafting capability.
pub fn alert_prompt(request: &AlertRequest) -> String {
    let start = request
        .recent_nudges
        .len()
        .saturating_sub(ALERT_NUDGE_HISTORY);
    let nudges = request.recent_nudges[start..]
        .iter()
        .map(|n| {
            let excerpt: String = n.content.chars().take(NUDGE_EXCERPT_CHARS).collect();
            format!(
                "- [{}] {}... (sent: {}, status: {})",
                n.nudge_type,
                excerpt,
                n.sent_at.to_rfc3339(),
                n.status
            )
        })
        .collect::<Vec<_>>();

    format!(
        "A user needs escalation to a human CSM:\n\n\
         **User ID:** {user}\n\
         **Stuck Point:** {stuck}\n\
         **Reason:** {reason}\n\
         **Nudges Sent (not effective, {count} total):**\n{nudges}\n\n\
         Draft an alert for the CSM.",
        user = request.user_id,
        stuck = request.diagnosis.stuck_point,
        reason = request.diagnosis.inferred_reason,
        count = request.nudge_count,
        nudges = if nudges.is_empty() {
            "No previous nudges recorded".to_string()
        } else {
            nudges.join("\n")
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coordination::state::Event;

    #[test]
    fn test_system_prompts_embed_schema() {
        let prompt = diagnosis_system_prompt();
        assert!(prompt.starts_with(DIAGNOSIS_PREAMBLE));
        assert!(prompt.contains("confidence_score"));
        assert!(coach_system_prompt().contains("in_app_chat"));
        assert!(alert_system_prompt().contains("priority"));
    }

    #[test]
    fn test_diagnosis_prompt_lists_events_in_order() {
        let now = Utc::now();
        let request = DiagnosisRequest {
            user_id: "u1".into(),
            session_id: "s1".into(),
            company_id: "acme".into(),
            stuck_point_hint: "invite_team".into(),
            trigger: "inactive for 180s".into(),
            session_duration_minutes: 4,
            last_event: Some("create_project".into()),
            baseline_summary: Some("signup → create_project → invite_team".into()),
            events: vec![
                Event::new("u1", "s1", "acme", "signup", now),
                Event::new("u1", "s1", "acme", "create_project", now).with_target("new-project"),
            ],
        };
        let prompt = diagnosis_prompt(&request);
        let signup = prompt.find("signup on").unwrap();
        let create = prompt.find("create_project on 'new-project'").unwrap();
        assert!(signup < create);
        assert!(prompt.contains("**Session Duration:** 4 minutes"));
        assert!(prompt.contains("signup → create_project → invite_team"));
    }
}
