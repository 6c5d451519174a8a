//! REST API module for external integrations
//!
//! Provides a read-only HTTP API for health checks, Prometheus metrics and
//! a summary of the Databases the operator manages.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
