pub mod keys;
pub mod middleware;

use std::sync::Arc;

use axum::{Router, middleware::from_fn_with_state, routing::get};

use caremesh_gateway::Gateway;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
}

/// Bearer-protected key routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/keys", axum::routing::put(keys::publish_key))
        .route("/users/{user_id}/public-key", get(keys::get_public_key))
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
