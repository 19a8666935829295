//! Engagement scoring: pure functions, no I/O.
//!
//! Two modes, kept apart on purpose:
//! - **Initial**: pre-engagement guesses from email domain, title and company
//!   size. Base 50, capped at 85, status capped at `warming`.
//! - **Dynamic**: once an explicit feedback rating exists. Raw points are
//!   clamped to `0..=210` and renormalised into `50..=100`.
//!
//! Both modes share one threshold table ([`status_for`]).

use leadflow_core::types::{Lead, LeadStatus, recipient_domain};
use serde::{Deserialize, Serialize};

/// Score at or above which a lead is `hot`.
pub const HOT_THRESHOLD: u8 = 75;
/// Score at or above which a lead is `warming`.
pub const WARMING_THRESHOLD: u8 = 60;

const INITIAL_BASE: u32 = 50;
const INITIAL_CAP: u32 = 85;
const DYNAMIC_DEFAULT_BASE: u32 = 50;
const DYNAMIC_RAW_MAX: u32 = 210;

const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
    "gmx.com",
];

/// Inputs of the pre-engagement heuristic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSignals {
    pub email: String,
    pub job_title: Option<String>,
    pub company_size: Option<u32>,
}

/// Inputs of the post-engagement heuristic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementSignals {
    pub feedback_score: Option<u8>,
    pub budget_range: Option<String>,
    pub timeline_days: Option<u32>,
    pub call_scheduled: bool,
    pub messaging_channel: bool,
}

/// Which heuristic to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringInput {
    Initial(InitialSignals),
    Engaged(EngagementSignals),
}

impl ScoringInput {
    /// Dynamic mode as soon as the lead has given explicit feedback.
    pub fn from_lead(lead: &Lead) -> Self {
        if lead.feedback_score.is_some() {
            ScoringInput::Engaged(EngagementSignals {
                feedback_score: lead.feedback_score,
                budget_range: lead.budget_range.clone(),
                timeline_days: lead.timeline_days,
                call_scheduled: lead.call_scheduled,
                messaging_channel: lead.messaging_channel,
            })
        } else {
            ScoringInput::Initial(InitialSignals {
                email: lead.email.clone(),
                job_title: lead.job_title.clone(),
                company_size: lead.company_size,
            })
        }
    }
}

/// Result of scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub value: u8,
    pub status: LeadStatus,
}

/// Score a lead's signals. Always returns `value` in `0..=100`.
pub fn score(input: &ScoringInput) -> Score {
    match input {
        ScoringInput::Initial(signals) => {
            let value = initial_score(signals);
            // Pre-engagement data alone never reaches the top tier.
            let status = status_for(value).min(LeadStatus::Warming);
            Score { value, status }
        }
        ScoringInput::Engaged(signals) => {
            let value = dynamic_score(signals);
            Score {
                value,
                status: status_for(value),
            }
        }
    }
}

/// Convenience wrapper for a whole lead.
pub fn score_lead(lead: &Lead) -> Score {
    score(&ScoringInput::from_lead(lead))
}

/// The single threshold table.
pub fn status_for(value: u8) -> LeadStatus {
    if value >= HOT_THRESHOLD {
        LeadStatus::Hot
    } else if value >= WARMING_THRESHOLD {
        LeadStatus::Warming
    } else {
        LeadStatus::Cold
    }
}

fn initial_score(signals: &InitialSignals) -> u8 {
    let mut total = INITIAL_BASE;

    if let Some(domain) = recipient_domain(&signals.email) {
        if !FREE_MAIL_DOMAINS.contains(&domain.as_str()) {
            total += 10;
        }
    }

    if let Some(title) = signals.job_title.as_deref() {
        total += seniority_points(title);
    }

    total += match signals.company_size {
        Some(n) if n >= 1000 => 10,
        Some(n) if n >= 200 => 7,
        Some(n) if n >= 50 => 5,
        _ => 0,
    };

    total.min(INITIAL_CAP) as u8
}

fn seniority_points(title: &str) -> u32 {
    let title = title.to_ascii_lowercase();
    let words: Vec<&str> = title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |w: &str| words.contains(&w);

    if title.contains("vice president") || ["vp", "director", "head"].iter().any(|w| has(w)) {
        10
    } else if ["ceo", "cto", "cfo", "coo", "cmo", "founder", "cofounder", "owner", "president", "chief"]
        .iter()
        .any(|w| has(w))
    {
        15
    } else if ["manager", "lead"].iter().any(|w| has(w)) {
        5
    } else {
        0
    }
}

fn dynamic_score(signals: &EngagementSignals) -> u8 {
    let mut raw = signals
        .feedback_score
        .map(|f| u32::from(f.min(100)))
        .unwrap_or(DYNAMIC_DEFAULT_BASE);

    raw += signals.budget_range.as_deref().map(budget_points).unwrap_or(0);
    raw += signals.timeline_days.map(timeline_points).unwrap_or(0);
    if signals.call_scheduled {
        raw += 30;
    }
    if signals.messaging_channel {
        raw += 10;
    }

    let clamped = raw.min(DYNAMIC_RAW_MAX) as f64;
    let normalized = 50.0 + (clamped / DYNAMIC_RAW_MAX as f64) * 50.0;
    normalized.round().clamp(0.0, 100.0) as u8
}

/// Budget bracket points. Unknown brackets score nothing.
pub fn budget_points(bracket: &str) -> u32 {
    match bracket.trim().to_ascii_lowercase().as_str() {
        "10_30k" => 10,
        "30_60k" => 20,
        "60_100k" => 30,
        "100k_plus" => 40,
        _ => 0,
    }
}

/// Urgency points keyed by days to deadline.
pub fn timeline_points(days: u32) -> u32 {
    match days {
        0..=14 => 30,
        15..=30 => 20,
        31..=90 => 10,
        _ => 5,
    }
}
