use axum::{extract::State, http::StatusCode};

use crate::handlers::Envelope;
use crate::state::AppState;

pub async fn index() -> Envelope<&'static str> {
    Envelope::success("Hello World!")
}

/// Liveness probe; the process is healthy even while the broker is down
pub async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    tracing::trace!(broker_connected = state.connection().is_connected(), "Health check");
    (StatusCode::OK, "OK")
}
