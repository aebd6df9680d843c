// handlers/payment_handlers.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::errors::{AppError, Result};
use crate::models::mpesa::{CallbackAck, CallbackEnvelope};
use crate::models::payment::{RelatedEntity, TransactionStatus, TransactionType};
use crate::models::user::Claims;
use crate::services::payment_service::{self, HistoryFilter, InitiateRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub phone_number: String,
    pub amount: i64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub description: String,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub status: Option<TransactionStatus>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub page: Option<u64>,
    pub limit: Option<i64>,
}

pub async fn initiate_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<impl IntoResponse> {
    let user_id = ObjectId::parse_str(&claims.sub)?;
    info!(
        "Payment initiation by {}: KSh {} ({})",
        user_id,
        request.amount,
        request.transaction_type.as_str()
    );

    let related_entity = match (&request.related_entity_id, &request.related_entity_type) {
        (Some(id), Some(entity_type)) => Some(RelatedEntity {
            entity_type: entity_type.clone(),
            entity_id: ObjectId::parse_str(id)?,
        }),
        (Some(_), None) => {
            return Err(AppError::validation(
                "related_entity_type is required when related_entity_id is given",
            ))
        }
        _ => None,
    };

    let (payment, gateway_message) = payment_service::initiate(
        &state,
        InitiateRequest {
            user_id,
            phone_number: request.phone_number,
            amount: request.amount,
            transaction_type: request.transaction_type,
            description: request.description,
            related_entity,
        },
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "transaction_id": payment.id.map(|id| id.to_hex()),
            "merchant_request_id": payment.merchant_request_id,
            "checkout_request_id": payment.checkout_request_id,
            "status": payment.status,
            "gateway_message": gateway_message,
        })),
    ))
}

/// The STK callback. Whatever happens inside, the gateway gets its
/// `{ResultCode, ResultDesc}` envelope back; a failure ack makes it retry,
/// which is wanted only when the transaction could not be found.
pub async fn mpesa_callback(
    State(state): State<AppState>,
    Json(envelope): Json<CallbackEnvelope>,
) -> Json<CallbackAck> {
    let callback = &envelope.body.stk_callback;
    info!(
        "M-Pesa callback for {} (result code {})",
        callback.checkout_request_id, callback.result_code
    );

    match payment_service::apply_callback(&state, callback).await {
        Ok(_) => Json(CallbackAck::success()),
        Err(AppError::CallbackNotFound(_)) => Json(CallbackAck::failure("Transaction not found")),
        Err(e) => {
            error!(
                "Callback for {} failed: {}",
                callback.checkout_request_id, e
            );
            Json(CallbackAck::failure("Internal error"))
        }
    }
}

pub async fn check_payment_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let user_id = ObjectId::parse_str(&claims.sub)?;
    let payment_id = ObjectId::parse_str(&id)?;

    let payment = payment_service::poll_status(&state, payment_id, user_id).await?;
    Ok(Json(payment))
}

pub async fn payment_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse> {
    let user_id = ObjectId::parse_str(&claims.sub)?;

    let page = payment_service::history(
        &state,
        user_id,
        HistoryFilter {
            status: query.status,
            transaction_type: query.transaction_type,
            page: query.page.unwrap_or(1),
            limit: query.limit.unwrap_or(20),
        },
    )
    .await?;

    Ok(Json(page))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let user_id = ObjectId::parse_str(&claims.sub)?;
    let payment_id = ObjectId::parse_str(&id)?;

    let payment = payment_service::cancel(&state, payment_id, user_id).await?;
    Ok(Json(json!({
        "success": true,
        "transaction_id": id,
        "status": payment.status,
    })))
}
