use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Create the control router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mq_routes = Router::new()
        .route("/status", get(handlers::mq::status))
        .route("/start", get(handlers::mq::start))
        .route("/stop", get(handlers::mq::stop))
        .route("/restart", get(handlers::mq::restart))
        .route("/remove", get(handlers::mq::remove))
        .route("/reread", get(handlers::mq::reread))
        .route("/update", get(handlers::mq::update));

    Router::new()
        .route("/", get(handlers::home::index))
        .route("/health", get(handlers::home::health))
        .nest("/mq", mq_routes)
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
