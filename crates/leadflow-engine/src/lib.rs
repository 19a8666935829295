//! # Leadflow Engine
//!
//! Lead engagement lifecycle: scoring, sequence planning, shared rate
//! limiting and message dispatch.
//!
//! ## Design Principles
//! - SQLite is the only shared state. Workers coordinate through conditional
//!   writes, never through in-process locks.
//! - Scoring is pure. Everything else goes through [`SequenceStore`].
//! - A message catalog is fixed at enrollment time.
//!
//! ## Architecture
//! ```text
//! funnel stage event
//!   └── LeadEngine::on_stage_complete
//!         ├── scoring::score          (initial | dynamic heuristic)
//!         └── SequencePlanner::enroll → sequences + queue_items (one tx)
//!
//! DispatchWorker (tokio interval or POST /api/v1/dispatch/run)
//!   ├── due_items  (next position per running sequence)
//!   ├── claim      (conditional UPDATE, claim TTL)
//!   ├── RateLimiter::allow (per recipient domain, shared window)
//!   ├── render + DeliveryProvider::send (timeout, in-cycle backoff)
//!   └── mark_sent | record_retry | mark_failed
//! ```

pub mod catalog;
pub mod dispatch;
pub mod engine;
pub mod links;
pub mod persistence;
pub mod planner;
pub mod rate_limit;
pub mod render;
pub mod scoring;

pub use dispatch::{DispatchReport, DispatchWorker, spawn_dispatcher};
pub use engine::{LeadEngine, LeadOverview, RetryPolicy, StageOutcome};
pub use links::UnsubscribeLinks;
pub use persistence::{QueueStats, SequenceStore, UnsubscribeReport};
pub use planner::{Enrollment, SequencePlanner};
pub use rate_limit::{RateDecision, RateLimiter};
pub use scoring::{Score, ScoringInput};
