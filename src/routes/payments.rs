use axum::{
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::payment_handlers;
use crate::middleware::{auth, callback_origin};
use crate::state::AppState;

pub fn payment_routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/initiate", post(payment_handlers::initiate_payment))
        .route("/:id/status", get(payment_handlers::check_payment_status))
        .route("/:id/cancel", put(payment_handlers::cancel_payment))
        .route("/history", get(payment_handlers::payment_history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // Public but origin-restricted in production
    let callback = Router::new()
        .route("/callback", post(payment_handlers::mpesa_callback))
        .route_layer(middleware::from_fn_with_state(
            state,
            callback_origin::callback_origin,
        ));

    Router::new()
        .route("/health", get(payments_health))
        .merge(protected)
        .merge(callback)
}

async fn payments_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "payments",
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "callback", "status-poll", "history", "cancel"]
    }))
}
