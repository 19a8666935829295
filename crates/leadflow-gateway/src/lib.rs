//! # Leadflow Gateway
//! HTTP surface of the engagement engine: funnel events, the public
//! unsubscribe link, sequence control and an external dispatch trigger.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start_server};
