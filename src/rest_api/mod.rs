//! REST API module
//!
//! Health and readiness probes, Prometheus metrics and a read-only view of
//! the pair coordination records.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
