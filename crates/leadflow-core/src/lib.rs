//! # Leadflow Core
//!
//! Shared vocabulary for the lead engagement engine: the persisted records
//! (leads, sequences, queue items), the error taxonomy, the delivery provider
//! seam and the TOML configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::LeadflowConfig;
pub use error::{DeliveryError, LeadflowError, Result};
pub use traits::{DeliveryProvider, DeliveryReceipt, OutboundMessage};
pub use types::{Lead, LeadStatus, NewLead, QueueItem, QueueItemState, Sequence, StageSignals};
