//! HTTP server implementation

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers::{health_handler, status_handler};
use crate::status::StatusReporter;

/// Build the application router
pub fn app(reporter: StatusReporter) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(reporter)
}

/// Run the web server
pub async fn run_web_server(
    addr: &str,
    reporter: StatusReporter,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = app(reporter);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Diagnostics available at http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
