use axum::{middleware, routing::get, Router};

use crate::handlers::subscription_handlers;
use crate::middleware::auth;
use crate::state::AppState;

pub fn subscription_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/access", get(subscription_handlers::subscription_access))
        .route_layer(middleware::from_fn_with_state(state, auth::auth_middleware))
}
