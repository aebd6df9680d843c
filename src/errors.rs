// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("Invalid amount: {0} (must be between 1 and 70000)")]
    InvalidAmount(i64),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Account already has a transaction in progress")]
    ActiveTransactionConflict,

    #[error("M-Pesa authentication failed: {0}")]
    GatewayAuth(String),

    #[error("M-Pesa request failed: {0}")]
    GatewayRequest(String),

    #[error("Callback rejected: untrusted origin")]
    CallbackOrigin,

    #[error("No transaction matches checkout request {0}")]
    CallbackNotFound(String),

    #[error("Transaction is already {0} and cannot be modified")]
    StateConflict(String),

    #[error("Transaction not found")]
    TransactionNotFound,

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    #[error("User not found")]
    UserNotFound,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("External API error: {0}")]
    ExternalApi(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::InvalidPhone(_) => (StatusCode::BAD_REQUEST, "Invalid phone number".to_string()),
            AppError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "Invalid amount".to_string()),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::ActiveTransactionConflict => (StatusCode::CONFLICT, "Active transaction exists".to_string()),
            AppError::GatewayAuth(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Payment service error".to_string()),
            AppError::GatewayRequest(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Payment service error".to_string()),
            AppError::CallbackOrigin => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::CallbackNotFound(_) => (StatusCode::NOT_FOUND, "Transaction not found".to_string()),
            AppError::StateConflict(_) => (StatusCode::CONFLICT, "Transaction already finalized".to_string()),
            AppError::TransactionNotFound => (StatusCode::NOT_FOUND, "Transaction not found".to_string()),
            AppError::InvalidObjectId(_) => (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()),
            AppError::UserNotFound => (StatusCode::NOT_FOUND, "User not found".to_string()),
            AppError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string()),
            AppError::ExternalApi(_) => (StatusCode::BAD_GATEWAY, "External API error".to_string()),
        };

        // Gateway/database detail stays out of production responses
        let message = if self.hide_detail_in_production() && is_production() {
            error_message.clone()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": error_message,
            "message": message,
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

fn is_production() -> bool {
    std::env::var("MPESA_ENVIRONMENT")
        .map(|env| env == "production")
        .unwrap_or(false)
}

impl AppError {
    fn hide_detail_in_production(&self) -> bool {
        matches!(
            self,
            AppError::GatewayAuth(_) | AppError::GatewayRequest(_) | AppError::MongoDB(_)
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        AppError::GatewayRequest(msg.into())
    }
}

// Manual From implementations
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApi(format!("HTTP request failed: {}", err))
    }
}

impl From<mongodb::bson::oid::Error> for AppError {
    fn from(err: mongodb::bson::oid::Error) -> Self {
        AppError::InvalidObjectId(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::ValidationError(format!("BSON serialization error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_callback_maps_to_not_found() {
        let response = AppError::CallbackNotFound("ws_CO_191220191020363925".to_string())
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn untrusted_origin_is_forbidden() {
        let response = AppError::CallbackOrigin.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn active_transaction_conflict_maps_to_409() {
        let response = AppError::ActiveTransactionConflict.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::StateConflict("completed".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_failures_are_bad_requests() {
        assert_eq!(
            AppError::InvalidPhone("12345".to_string())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::InvalidAmount(0).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
