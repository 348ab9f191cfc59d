//! HTTP handlers for the diagnostics interface

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::status::StatusReporter;

/// Outcome of one probe
#[derive(Debug, Serialize)]
pub struct HealthCheck {
    pub ok: bool,
    /// Error kind, when the probe failed
    pub error: Option<String>,
    pub message: Option<String>,
}

impl HealthCheck {
    fn from_result(result: &Result<RespValue>) -> Self {
        match result {
            Ok(_) => HealthCheck {
                ok: true,
                error: None,
                message: None,
            },
            Err(e) => HealthCheck {
                ok: false,
                error: Some(e.kind().to_string()),
                message: Some(e.to_string()),
            },
        }
    }
}

/// Response for the health endpoint
#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `healthy` or `unhealthy`
    pub status: &'static str,
    pub write: HealthCheck,
    pub read: HealthCheck,
}

/// HTTP status for a routing error
pub fn status_code(error: &Error) -> StatusCode {
    match error {
        Error::QuorumUnavailable { .. }
        | Error::NoPrimaryElected(_)
        | Error::PoolExhausted { .. }
        | Error::BrokenConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Upstream(_) | Error::Protocol(_) => StatusCode::BAD_GATEWAY,
        Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status_code(&self), Json(body)).into_response()
    }
}

/// Current status snapshot
pub async fn status_handler(State(reporter): State<StatusReporter>) -> impl IntoResponse {
    (StatusCode::OK, Json(reporter.status()))
}

/// Ping the primary and a replica through the router
pub async fn health_handler(State(reporter): State<StatusReporter>) -> Response {
    let router = reporter.router();
    let ping = RespValue::command(["PING"]);

    let write = router.write(&ping).await;
    let read = router.read(&ping).await;
    debug!("Health probe: write ok={} read ok={}", write.is_ok(), read.is_ok());

    let code = match (&write, &read) {
        (Err(e), _) | (_, Err(e)) => status_code(e),
        _ => StatusCode::OK,
    };

    let report = HealthReport {
        status: if write.is_ok() && read.is_ok() { "healthy" } else { "unhealthy" },
        write: HealthCheck::from_result(&write),
        read: HealthCheck::from_result(&read),
    };

    (code, Json(report)).into_response()
}
