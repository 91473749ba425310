use super::handlers;
use crate::server::middleware::admission_middleware;
use crate::server::state::AppState;
use axum::{middleware, routing::put, Router};

/// Routes behind the admission chain
pub fn routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/service/{service_id}", put(handlers::update_service))
        .route_layer(middleware::from_fn_with_state(
            state.admission.clone(),
            admission_middleware,
        ))
}
