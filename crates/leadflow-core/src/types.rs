//! Persisted records: leads, sequences and queued messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};

/// Engagement tier derived from the score. Never hand-edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    Cold,
    Warming,
    Hot,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Cold => "cold",
            LeadStatus::Warming => "warming",
            LeadStatus::Hot => "hot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cold" => Some(LeadStatus::Cold),
            "warming" => Some(LeadStatus::Warming),
            "hot" => Some(LeadStatus::Hot),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prospective customer produced by the funnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
    /// Job title, used by the pre-engagement heuristic.
    pub job_title: Option<String>,
    /// Employee headcount, used by the pre-engagement heuristic.
    pub company_size: Option<u32>,
    /// Engagement score, 0..=100.
    pub score: u8,
    pub status: LeadStatus,
    /// Explicit feedback rating (0..=100). Its presence switches scoring to the dynamic mode.
    pub feedback_score: Option<u8>,
    /// Budget bracket key, e.g. `30_60k`.
    pub budget_range: Option<String>,
    /// Days until the lead's desired deadline.
    pub timeline_days: Option<u32>,
    pub call_scheduled: bool,
    /// Whether a direct-messaging channel was added.
    pub messaging_channel: bool,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload from the first funnel step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLead {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub company_size: Option<u32>,
}

/// Partial update carried by a funnel-stage completion event.
/// Absent fields leave the lead untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSignals {
    /// Name of the completed wizard step (logging only).
    pub stage: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub company_size: Option<u32>,
    pub feedback_score: Option<u8>,
    pub budget_range: Option<String>,
    pub timeline_days: Option<u32>,
    pub call_scheduled: Option<bool>,
    pub messaging_channel: Option<bool>,
    /// Opaque render inputs supplied by the content source, persisted per queue item at enrollment.
    pub context: Option<serde_json::Value>,
}

impl Lead {
    /// Build a fresh lead from a registration. Score/status start at the neutral
    /// baseline; callers rescore before persisting.
    pub fn new(new: NewLead, now: DateTime<Utc>) -> Result<Self> {
        let email = new.email.trim().to_ascii_lowercase();
        if !is_valid_email(&email) {
            return Err(LeadflowError::validation(format!(
                "malformed email address '{}'",
                new.email
            )));
        }
        Ok(Self {
            id: format!("lead-{}", uuid::Uuid::new_v4()),
            email,
            name: non_empty(new.name),
            company: non_empty(new.company),
            job_title: non_empty(new.job_title),
            company_size: new.company_size,
            score: 50,
            status: LeadStatus::Cold,
            feedback_score: None,
            budget_range: None,
            timeline_days: None,
            call_scheduled: false,
            messaging_channel: false,
            unsubscribed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Merge the behavioral fields of a stage event into this lead.
    pub fn apply(&mut self, signals: &StageSignals, now: DateTime<Utc>) {
        if let Some(name) = non_empty(signals.name.clone()) {
            self.name = Some(name);
        }
        if let Some(company) = non_empty(signals.company.clone()) {
            self.company = Some(company);
        }
        if let Some(title) = non_empty(signals.job_title.clone()) {
            self.job_title = Some(title);
        }
        if signals.company_size.is_some() {
            self.company_size = signals.company_size;
        }
        if let Some(rating) = signals.feedback_score {
            self.feedback_score = Some(rating.min(100));
        }
        if let Some(budget) = non_empty(signals.budget_range.clone()) {
            self.budget_range = Some(budget);
        }
        if signals.timeline_days.is_some() {
            self.timeline_days = signals.timeline_days;
        }
        if let Some(call) = signals.call_scheduled {
            self.call_scheduled = call;
        }
        if let Some(messaging) = signals.messaging_channel {
            self.messaging_channel = messaging;
        }
        self.updated_at = now;
    }

    /// First word of the name, for greetings.
    pub fn first_name(&self) -> Option<&str> {
        self.name.as_deref().and_then(|n| n.split_whitespace().next())
    }
}

/// One enrollment of a lead into a fixed message catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub lead_id: String,
    /// Status snapshot that selected the catalog. Later score changes do not retarget.
    pub status_at_enrollment: LeadStatus,
    /// Number of catalog positions that have been sent or permanently failed.
    pub current_message_number: u32,
    pub total_messages: u32,
    pub next_send_at: Option<DateTime<Utc>>,
    pub is_completed: bool,
    pub is_paused: bool,
    pub is_unsubscribed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    /// Counts toward the one-active-sequence-per-lead limit.
    pub fn is_active(&self) -> bool {
        !self.is_completed && !self.is_unsubscribed
    }
}

/// One scheduled message within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub lead_id: String,
    pub sequence_id: String,
    pub template_id: String,
    /// 1-based catalog position.
    pub position: u32,
    pub scheduled_at: DateTime<Utc>,
    pub context: serde_json::Value,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Earliest time of the next attempt after a transient failure or a
    /// rate-limit deferral.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
}

/// Coarse lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemState {
    Pending,
    Sent,
    Failed,
}

impl QueueItem {
    pub fn state(&self) -> QueueItemState {
        if self.sent {
            QueueItemState::Sent
        } else if self.failed_at.is_some() {
            QueueItemState::Failed
        } else {
            QueueItemState::Pending
        }
    }
}

/// Loose syntactic check of a recipient address: one `@`, non-empty local
/// part, dotted domain, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

/// Lower-cased domain part of a valid address.
pub fn recipient_domain(email: &str) -> Option<String> {
    if !is_valid_email(email) {
        return None;
    }
    email
        .trim()
        .rsplit('@')
        .next()
        .map(|d| d.to_ascii_lowercase())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_names() {
        assert_eq!(LeadStatus::parse("HOT"), Some(LeadStatus::Hot));
        assert_eq!(LeadStatus::parse("warming"), Some(LeadStatus::Warming));
        assert_eq!(LeadStatus::parse("lukewarm"), None);
        assert_eq!(LeadStatus::Cold.to_string(), "cold");
        assert!(LeadStatus::Hot > LeadStatus::Warming);
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ana@acme.io"));
        assert!(!is_valid_email("ana@acme"));
        assert!(!is_valid_email("ana@@acme.io"));
        assert!(!is_valid_email("@acme.io"));
        assert!(!is_valid_email("ana @acme.io"));
        assert!(!is_valid_email("ana@acme..io"));
        assert_eq!(recipient_domain("Ana@ACME.io").as_deref(), Some("acme.io"));
        assert_eq!(recipient_domain("broken"), None);
    }

    #[test]
    fn test_new_lead_rejects_bad_email() {
        let err = Lead::new(
            NewLead {
                email: "not-an-email".into(),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, LeadflowError::Validation(_)));
    }

    #[test]
    fn test_apply_partial_signals() {
        let now = Utc::now();
        let mut lead = Lead::new(
            NewLead {
                email: " Ana@Acme.io ".into(),
                name: Some("Ana Lima".into()),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(lead.email, "ana@acme.io");
        assert_eq!(lead.first_name(), Some("Ana"));

        lead.apply(
            &StageSignals {
                feedback_score: Some(140),
                call_scheduled: Some(true),
                budget_range: Some("  ".into()),
                ..Default::default()
            },
            now,
        );
        assert_eq!(lead.feedback_score, Some(100));
        assert!(lead.call_scheduled);
        assert!(lead.budget_range.is_none());
        assert_eq!(lead.name.as_deref(), Some("Ana Lima"));
    }

    #[test]
    fn test_sequence_activity() {
        let now = Utc::now();
        let mut seq = Sequence {
            id: "s".into(),
            lead_id: "l".into(),
            status_at_enrollment: LeadStatus::Hot,
            current_message_number: 0,
            total_messages: 3,
            next_send_at: Some(now),
            is_completed: false,
            is_paused: true,
            is_unsubscribed: false,
            created_at: now,
            updated_at: now,
        };
        assert!(seq.is_active());
        seq.is_unsubscribed = true;
        assert!(!seq.is_active());
    }
}
