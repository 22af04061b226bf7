//! HTTP API - the request layer over the agent core.

mod routes;
pub mod types;

pub use routes::{serve, AppState};
