//! Diagnostics interface
//!
//! A small HTTP server exposing the router's status and a live health check.
//! It carries no key/value traffic.

mod handlers;
mod server;

pub use handlers::{status_code, HealthCheck, HealthReport};
pub use server::{app, run_web_server};
