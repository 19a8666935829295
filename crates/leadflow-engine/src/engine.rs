//! Lifecycle facade: what the funnel and the gateway call.
//!
//! Funnel-facing bookkeeping never blocks the user: when the store fails while
//! rescoring or enrolling, the event is queued and replayed in the background
//! with exponential backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::{Lead, NewLead, QueueItem, Sequence, StageSignals};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::persistence::{SequenceStore, UnsubscribeReport};
use crate::planner::{Enrollment, SequencePlanner};
use crate::scoring::{self, Score};

/// Background replay policy for failed funnel events.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: StdDuration::from_secs(2),
            max_delay: StdDuration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> StdDuration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A funnel event waiting to be replayed.
#[derive(Debug, Clone)]
pub struct RetryJob {
    pub lead_id: String,
    pub signals: StageSignals,
    pub attempt: u32,
}

/// Result of a funnel stage event.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub lead_id: String,
    /// `None` when the event was queued for a background retry.
    pub score: Option<Score>,
    pub enrollment: Option<Enrollment>,
    pub queued_for_retry: bool,
}

/// A lead with its enrollments.
#[derive(Debug, Clone, Serialize)]
pub struct LeadOverview {
    pub lead: Lead,
    pub sequences: Vec<Sequence>,
}

pub struct LeadEngine {
    store: Arc<SequenceStore>,
    planner: SequencePlanner,
    retry_policy: RetryPolicy,
    retry_tx: mpsc::UnboundedSender<RetryJob>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RetryJob>>>,
}

impl LeadEngine {
    pub fn new(store: Arc<SequenceStore>) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            planner: SequencePlanner::new(store.clone()),
            store,
            retry_policy: RetryPolicy::default(),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<SequenceStore> {
        &self.store
    }

    /// Create a lead with its initial score. A known email returns the
    /// existing lead so an opt-out cannot be bypassed by registering again.
    pub fn register_lead(&self, new: NewLead) -> Result<Lead> {
        self.register_lead_at(new, Utc::now())
    }

    pub fn register_lead_at(&self, new: NewLead, now: DateTime<Utc>) -> Result<Lead> {
        let mut lead = Lead::new(new, now)?;
        if let Some(existing) = self.store.find_lead_by_email(&lead.email)? {
            tracing::debug!("Lead {} already registered for {}", existing.id, existing.email);
            return Ok(existing);
        }
        let score = scoring::score_lead(&lead);
        lead.score = score.value;
        lead.status = score.status;
        self.store.upsert_lead(&lead)?;
        tracing::info!("👤 Registered {} ({} {})", lead.id, lead.score, lead.status);
        Ok(lead)
    }

    /// Funnel stage completed: merge signals, rescore, enroll if nothing is
    /// running. Store failures are queued for replay and reported as
    /// `queued_for_retry`; only caller mistakes come back as errors.
    pub fn on_stage_complete(&self, lead_id: &str, signals: StageSignals) -> Result<StageOutcome> {
        self.on_stage_complete_at(lead_id, signals, Utc::now())
    }

    pub fn on_stage_complete_at(
        &self,
        lead_id: &str,
        signals: StageSignals,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        match self.apply_stage(lead_id, &signals, now) {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_persistence() => {
                tracing::warn!("⚠️ Stage event for {} queued for retry: {}", lead_id, e);
                self.queue_retry(RetryJob {
                    lead_id: lead_id.to_string(),
                    signals,
                    attempt: 0,
                });
                Ok(StageOutcome {
                    lead_id: lead_id.to_string(),
                    score: None,
                    enrollment: None,
                    queued_for_retry: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn apply_stage(
        &self,
        lead_id: &str,
        signals: &StageSignals,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        let mut lead = self
            .store
            .get_lead(lead_id)?
            .ok_or_else(|| LeadflowError::not_found(format!("lead {lead_id}")))?;

        lead.apply(signals, now);
        let score = scoring::score_lead(&lead);
        if score.status != lead.status {
            tracing::info!(
                "📈 {} {} → {} (score {})",
                lead.id,
                lead.status,
                score.status,
                score.value
            );
        }
        lead.score = score.value;
        lead.status = score.status;
        self.store.upsert_lead(&lead)?;

        let enrollment = if lead.unsubscribed_at.is_some() {
            Enrollment::Unsubscribed
        } else {
            let context = signals.context.clone().unwrap_or(serde_json::Value::Null);
            self.planner.enroll_at(&lead, score.status, context, now)?
        };

        Ok(StageOutcome {
            lead_id: lead.id,
            score: Some(score),
            enrollment: Some(enrollment),
            queued_for_retry: false,
        })
    }

    fn queue_retry(&self, job: RetryJob) {
        if self.retry_tx.send(job).is_err() {
            tracing::error!("❌ Retry queue closed, stage event dropped");
        }
    }

    /// Start the background replay task. Returns `None` if already started.
    pub fn spawn_retrier(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.retry_rx.lock().ok()?.take()?;
        let engine = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            tracing::info!("🔁 Stage event retrier started");
            while let Some(job) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    tokio::time::sleep(engine.retry_policy.delay(job.attempt)).await;
                    engine.replay(job);
                });
            }
            tracing::info!("🔁 Stage event retrier stopped");
        }))
    }

    fn replay(&self, job: RetryJob) {
        match self.apply_stage(&job.lead_id, &job.signals, Utc::now()) {
            Ok(outcome) => tracing::info!(
                "✅ Replayed stage event for {} after {} attempt(s): {:?}",
                job.lead_id,
                job.attempt + 1,
                outcome.enrollment
            ),
            Err(e) if e.is_persistence() && job.attempt + 1 < self.retry_policy.max_attempts => {
                tracing::warn!(
                    "⚠️ Replay {} for {} failed: {}",
                    job.attempt + 1,
                    job.lead_id,
                    e
                );
                self.queue_retry(RetryJob {
                    attempt: job.attempt + 1,
                    ..job
                });
            }
            Err(e) => tracing::error!(
                "❌ Giving up on stage event for {} after {} attempt(s): {}",
                job.lead_id,
                job.attempt + 1,
                e
            ),
        }
    }

    /// Opt a lead out of everything. Idempotent.
    pub fn unsubscribe(&self, lead_id: &str) -> Result<UnsubscribeReport> {
        self.unsubscribe_at(lead_id, Utc::now())
    }

    pub fn unsubscribe_at(&self, lead_id: &str, now: DateTime<Utc>) -> Result<UnsubscribeReport> {
        if self.store.get_lead(lead_id)?.is_none() {
            return Err(LeadflowError::not_found(format!("lead {lead_id}")));
        }
        let report = self.store.unsubscribe_lead(lead_id, now)?;
        tracing::info!(
            "🚫 Unsubscribed {}: {} sequence(s) frozen, {} message(s) purged",
            lead_id,
            report.sequences_frozen,
            report.messages_purged
        );
        Ok(report)
    }

    pub fn pause(&self, sequence_id: &str) -> Result<Sequence> {
        self.set_paused(sequence_id, true)
    }

    /// Resume a paused sequence. Unsubscribed sequences stay frozen.
    pub fn resume(&self, sequence_id: &str) -> Result<Sequence> {
        self.set_paused(sequence_id, false)
    }

    fn set_paused(&self, sequence_id: &str, paused: bool) -> Result<Sequence> {
        let changed = self.store.set_paused(sequence_id, paused, Utc::now())?;
        let sequence = self
            .store
            .get_sequence(sequence_id)?
            .ok_or_else(|| LeadflowError::not_found(format!("sequence {sequence_id}")))?;
        if !changed {
            return Err(LeadflowError::validation(format!(
                "sequence {sequence_id} is unsubscribed and cannot be resumed"
            )));
        }
        tracing::info!(
            "{} sequence {}",
            if paused { "⏸️ Paused" } else { "▶️ Resumed" },
            sequence_id
        );
        Ok(sequence)
    }

    pub fn lead_overview(&self, lead_id: &str) -> Result<LeadOverview> {
        let lead = self
            .store
            .get_lead(lead_id)?
            .ok_or_else(|| LeadflowError::not_found(format!("lead {lead_id}")))?;
        let sequences = self.store.sequences_for_lead(lead_id)?;
        Ok(LeadOverview { lead, sequences })
    }

    pub fn sequence_messages(&self, sequence_id: &str) -> Result<Vec<QueueItem>> {
        if self.store.get_sequence(sequence_id)?.is_none() {
            return Err(LeadflowError::not_found(format!("sequence {sequence_id}")));
        }
        self.store.queue_items_for_sequence(sequence_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::types::LeadStatus;

    fn engine() -> LeadEngine {
        LeadEngine::new(Arc::new(SequenceStore::open_in_memory().unwrap()))
    }

    fn register(engine: &LeadEngine, email: &str) -> Lead {
        engine
            .register_lead(NewLead {
                email: email.into(),
                name: Some("Ana Lima".into()),
                job_title: Some("Head of Operations".into()),
                company_size: Some(250),
                ..Default::default()
            })
            .unwrap()
    }

    fn hot_signals() -> StageSignals {
        StageSignals {
            feedback_score: Some(100),
            budget_range: Some("30_60k".into()),
            timeline_days: Some(10),
            call_scheduled: Some(true),
            messaging_channel: Some(true),
            context: Some(serde_json::json!({"blueprint_title": "Plan"})),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_scores_and_dedups_by_email() {
        let engine = engine();
        let lead = register(&engine, "Ana@Acme.io");
        // 50 + 10 domain + 10 head + 7 size
        assert_eq!(lead.score, 77);
        assert_eq!(lead.status, LeadStatus::Warming);

        let again = register(&engine, "ana@acme.io");
        assert_eq!(again.id, lead.id);

        let err = engine
            .register_lead(NewLead {
                email: "nope".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LeadflowError::Validation(_)));
    }

    #[test]
    fn test_stage_event_rescores_and_enrolls_once() {
        let engine = engine();
        let lead = register(&engine, "ana@acme.io");

        let outcome = engine.on_stage_complete(&lead.id, hot_signals()).unwrap();
        let score = outcome.score.unwrap();
        assert_eq!(score.value, 95);
        assert_eq!(score.status, LeadStatus::Hot);
        let Some(Enrollment::Created(seq_id)) = outcome.enrollment else {
            panic!("expected a new sequence");
        };

        let again = engine.on_stage_complete(&lead.id, StageSignals::default()).unwrap();
        assert_eq!(again.enrollment, Some(Enrollment::AlreadyActive(seq_id.clone())));

        let overview = engine.lead_overview(&lead.id).unwrap();
        assert_eq!(overview.lead.status, LeadStatus::Hot);
        assert_eq!(overview.sequences.len(), 1);
        assert_eq!(overview.sequences[0].status_at_enrollment, LeadStatus::Hot);
        assert_eq!(engine.sequence_messages(&seq_id).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_lead_is_not_found() {
        let engine = engine();
        let err = engine.on_stage_complete("lead-x", StageSignals::default()).unwrap_err();
        assert!(matches!(err, LeadflowError::NotFound(_)));
        assert!(matches!(
            engine.unsubscribe("lead-x").unwrap_err(),
            LeadflowError::NotFound(_)
        ));
        assert!(matches!(engine.pause("seq-x").unwrap_err(), LeadflowError::NotFound(_)));
    }

    #[test]
    fn test_unsubscribe_blocks_future_enrollment() {
        let engine = engine();
        let lead = register(&engine, "ana@acme.io");
        engine.on_stage_complete(&lead.id, hot_signals()).unwrap();

        let report = engine.unsubscribe(&lead.id).unwrap();
        assert_eq!(report.messages_purged, 3);
        assert_eq!(engine.store().unsent_count_for_lead(&lead.id).unwrap(), 0);

        let outcome = engine.on_stage_complete(&lead.id, hot_signals()).unwrap();
        assert_eq!(outcome.enrollment, Some(Enrollment::Unsubscribed));
        assert_eq!(engine.lead_overview(&lead.id).unwrap().sequences.len(), 1);

        // Second unsubscribe is a no-op.
        assert_eq!(engine.unsubscribe(&lead.id).unwrap().messages_purged, 0);
    }

    #[test]
    fn test_pause_resume_and_frozen_resume() {
        let engine = engine();
        let lead = register(&engine, "ana@acme.io");
        let outcome = engine.on_stage_complete(&lead.id, hot_signals()).unwrap();
        let seq_id = outcome.enrollment.unwrap().sequence_id().unwrap().to_string();

        assert!(engine.pause(&seq_id).unwrap().is_paused);
        assert!(!engine.resume(&seq_id).unwrap().is_paused);

        engine.unsubscribe(&lead.id).unwrap();
        let err = engine.resume(&seq_id).unwrap_err();
        assert!(matches!(err, LeadflowError::Validation(_)));
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), StdDuration::from_secs(2));
        assert_eq!(policy.delay(3), StdDuration::from_secs(16));
        assert_eq!(policy.delay(20), StdDuration::from_secs(300));
    }

    #[tokio::test]
    async fn test_store_failure_is_queued_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leadflow.db");
        let engine = Arc::new(
            LeadEngine::new(Arc::new(SequenceStore::open(&path).unwrap())).with_retry_policy(
                RetryPolicy {
                    max_attempts: 5,
                    base_delay: StdDuration::from_millis(10),
                    max_delay: StdDuration::from_millis(50),
                },
            ),
        );
        let lead = register(&engine, "ana@acme.io");

        // Break enrollment from outside the store.
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute_batch("DROP TABLE queue_items; DROP TABLE sequences;").unwrap();

        let outcome = engine.on_stage_complete(&lead.id, hot_signals()).unwrap();
        assert!(outcome.queued_for_retry);
        assert!(outcome.enrollment.is_none());

        // Repair the schema, then let the retrier catch up.
        drop(SequenceStore::open(&path).unwrap());
        let handle = engine.spawn_retrier().unwrap();
        assert!(engine.spawn_retrier().is_none());

        let mut enrolled = false;
        for _ in 0..100 {
            if !engine.store().sequences_for_lead(&lead.id).unwrap().is_empty() {
                enrolled = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert!(enrolled, "stage event was not replayed");
        handle.abort();
    }
}
