//! Sequence planning: turns a status tier into a persisted, time-ordered
//! message plan.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::{Lead, LeadStatus, is_valid_email};
use serde::Serialize;

use crate::catalog;
use crate::persistence::SequenceStore;

/// One message of a plan, before it gets an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMessage {
    pub template_id: String,
    /// 1-based order within the sequence.
    pub position: u32,
    pub scheduled_at: DateTime<Utc>,
}

/// Everything the store needs to enroll a lead atomically.
#[derive(Debug, Clone)]
pub struct EnrollmentPlan {
    pub lead_id: String,
    pub status: LeadStatus,
    /// Opaque content snapshot, copied onto every queued message.
    pub context: serde_json::Value,
    pub now: DateTime<Utc>,
    pub messages: Vec<PlannedMessage>,
}

/// Outcome of an enrollment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "sequence_id", rename_all = "snake_case")]
pub enum Enrollment {
    /// A new sequence was created.
    Created(String),
    /// The lead already had a running sequence; nothing was written.
    AlreadyActive(String),
    /// The lead opted out. Nothing is ever enrolled for it again.
    Unsubscribed,
}

impl Enrollment {
    pub fn sequence_id(&self) -> Option<&str> {
        match self {
            Enrollment::Created(id) | Enrollment::AlreadyActive(id) => Some(id),
            Enrollment::Unsubscribed => None,
        }
    }
}

/// Plans and persists sequences.
pub struct SequencePlanner {
    store: Arc<SequenceStore>,
}

impl SequencePlanner {
    pub fn new(store: Arc<SequenceStore>) -> Self {
        Self { store }
    }

    /// Build the plan for `status` without touching the store.
    pub fn plan(
        lead: &Lead,
        status: LeadStatus,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentPlan> {
        if !is_valid_email(&lead.email) {
            return Err(LeadflowError::validation(format!(
                "invalid recipient address '{}'",
                lead.email
            )));
        }

        let messages = catalog::entries_for(status)
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                if catalog::template(entry.template_id).is_none() {
                    return Err(LeadflowError::validation(format!(
                        "unknown template id '{}'",
                        entry.template_id
                    )));
                }
                Ok(PlannedMessage {
                    template_id: entry.template_id.to_string(),
                    position: i as u32 + 1,
                    scheduled_at: now + Duration::minutes(entry.delay_minutes),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let context = if context.is_null() {
            serde_json::json!({})
        } else {
            context
        };

        Ok(EnrollmentPlan {
            lead_id: lead.id.clone(),
            status,
            context,
            now,
            messages,
        })
    }

    /// Enroll `lead` in the catalog for `status`, starting now.
    pub fn enroll(
        &self,
        lead: &Lead,
        status: LeadStatus,
        context: serde_json::Value,
    ) -> Result<Enrollment> {
        self.enroll_at(lead, status, context, Utc::now())
    }

    /// Enroll with an explicit clock. A lead with a running sequence keeps it;
    /// an unsubscribed lead is refused.
    pub fn enroll_at(
        &self,
        lead: &Lead,
        status: LeadStatus,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let plan = Self::plan(lead, status, context, now)?;
        let outcome = self.store.insert_enrollment(&plan)?;
        match &outcome {
            Enrollment::Created(id) => tracing::info!(
                "📬 Enrolled {} in {} sequence {} ({} messages)",
                lead.id,
                status,
                id,
                plan.messages.len()
            ),
            Enrollment::AlreadyActive(id) => {
                tracing::debug!("Lead {} already in sequence {}", lead.id, id)
            }
            Enrollment::Unsubscribed => {
                tracing::info!("🚫 Lead {} is unsubscribed, not enrolling", lead.id)
            }
        }
        Ok(outcome)
    }
}
