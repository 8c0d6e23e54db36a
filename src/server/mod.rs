//! HTTP surface, a thin layer over the reconciler.
//!
//! Routes:
//! - `POST /v1/nodes`: admit a candidate host
//! - `GET  /v1/clusters/{cluster_id}/nodes`: bound nodes, merged views
//! - `GET  /v1/nodes/unbound`: live nodes with no registry entry
//! - `GET  /health`: liveness

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod state;

pub use state::AppState;

/// Create the router with all routes configured
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/nodes", post(handlers::add_node))
        .route("/v1/nodes/unbound", get(handlers::list_unbound_nodes))
        .route(
            "/v1/clusters/{cluster_id}/nodes",
            get(handlers::list_bound_nodes),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
