// handlers/subscription_handlers.rs
use axum::{extract::State, response::IntoResponse, Extension, Json};
use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use serde_json::json;

use crate::errors::Result;
use crate::models::user::Claims;
use crate::services::subscription_service;
use crate::state::AppState;

/// Current access snapshot. Loading the subscription lazily deactivates a
/// lapsed term first, so `has_access` never reflects an expired plan.
pub async fn subscription_access(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse> {
    let user_id = ObjectId::parse_str(&claims.sub)?;

    let mut subscription = subscription_service::load_current(&state.db, user_id).await?;
    let has_access = subscription.has_access(Utc::now());
    let is_expiring_soon = subscription.is_expiring_soon(Utc::now());

    Ok(Json(json!({
        "has_access": has_access,
        "is_expiring_soon": is_expiring_soon,
        "subscription": subscription,
    })))
}
