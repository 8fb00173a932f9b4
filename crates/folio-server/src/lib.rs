pub mod args;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod state;

use axum::{middleware, routing::get, Router};

use crate::handlers::{active_request, cancellation_status, coordinate, healthz};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

pub fn app(st: AppState) -> Router {
    let internal_routes = Router::new()
        .route("/internal/cancellation/:user_id/:token", get(cancellation_status))
        .route("/internal/active/:user_id", get(active_request));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .route("/metrics", get(metrics_handler))
        .merge(internal_routes)
        .fallback(coordinate)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}
