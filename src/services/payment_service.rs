// services/payment_service.rs
//
// The transaction state machine. The webhook and the poller both land in
// `finalize`, whose conditional update is the only door into the
// post-payment dispatcher.
use chrono::Utc;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::options::ReturnDocument;
use mongodb::Collection;
use tracing::{error, info, warn};

use crate::errors::{AppError, Result};
use crate::models::mpesa::{SettlementInfo, StkCallback};
use crate::models::payment::{
    validate_amount, Payment, RelatedEntity, TransactionStatus, TransactionType,
};
use crate::services::dispatcher;
use crate::services::mpesa_service::{normalize_phone, ChargeOutcome};
use crate::state::AppState;

pub const PAYMENTS_COLLECTION: &str = "payments";

fn payments(state: &AppState) -> Collection<Payment> {
    state.db.collection(PAYMENTS_COLLECTION)
}

const ACTIVE_STATUSES: [&str; 2] = ["pending", "processing"];

fn active_filter_for(user_id: ObjectId) -> Document {
    doc! { "user_id": user_id, "status": { "$in": ACTIVE_STATUSES.to_vec() } }
}

#[derive(Debug)]
pub struct InitiateRequest {
    pub user_id: ObjectId,
    pub phone_number: String,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub description: String,
    pub related_entity: Option<RelatedEntity>,
}

/// Validates, enforces the one-active-transaction rule and fires the STK
/// push. The unique partial index on (user_id, active status) backs up the
/// pre-check against concurrent initiations. Returns the transaction plus
/// the gateway's customer-facing message.
pub async fn initiate(state: &AppState, request: InitiateRequest) -> Result<(Payment, String)> {
    let phone = normalize_phone(&request.phone_number)?;
    validate_amount(request.amount)?;
    let mpesa = state.mpesa()?;

    let collection = payments(state);

    // Lazy sweep: an active-looking transaction past its window is expired
    // here instead of blocking the new one.
    if let Some(existing) = collection
        .find_one(active_filter_for(request.user_id))
        .await?
    {
        if existing.is_expired_at(Utc::now()) {
            expire_one(&collection, &existing).await?;
        } else {
            return Err(AppError::ActiveTransactionConflict);
        }
    }

    let account_reference = format!("MZG-{}", ObjectId::new().to_hex().to_uppercase());
    let payment = Payment::new(
        request.user_id,
        request.transaction_type,
        request.amount,
        phone.clone(),
        account_reference.clone(),
        request.description.clone(),
        request.related_entity,
    );

    if let Err(e) = collection.insert_one(&payment).await {
        if is_duplicate_key(&e) {
            return Err(AppError::ActiveTransactionConflict);
        }
        return Err(e.into());
    }

    let payment_id = payment.id.expect("payment id set at construction");

    let charge = mpesa
        .stk_push(&phone, request.amount, &account_reference, &request.description)
        .await;

    match charge {
        Ok(ChargeOutcome::Accepted {
            merchant_request_id,
            checkout_request_id,
            customer_message,
        }) => {
            let updated = collection
                .find_one_and_update(
                    doc! { "_id": payment_id, "status": "pending" },
                    doc! { "$set": {
                        "status": "processing",
                        "merchant_request_id": merchant_request_id.as_str(),
                        "checkout_request_id": checkout_request_id.as_str(),
                    }},
                )
                .return_document(ReturnDocument::After)
                .await?;

            info!(
                "Payment {} accepted by gateway: {} / {}",
                payment_id, merchant_request_id, checkout_request_id
            );
            let payment = updated.ok_or(AppError::TransactionNotFound)?;
            Ok((payment, customer_message))
        }
        Ok(ChargeOutcome::Rejected { reason }) => {
            mark_failed(&collection, payment_id, None, &reason).await?;
            warn!("Payment {} rejected by gateway: {}", payment_id, reason);
            Err(AppError::GatewayRequest(reason))
        }
        Ok(ChargeOutcome::TransportError) => {
            // The charge may still be live gateway-side; leave it pending
            // and let the expiry sweep terminalize it if nothing arrives.
            warn!("Payment {} in limbo after transport error", payment_id);
            Err(AppError::GatewayRequest(
                "payment gateway unreachable, try again shortly".to_string(),
            ))
        }
        Err(e) => {
            // Auth failure: the charge was never sent
            mark_failed(&collection, payment_id, None, "gateway authentication failed").await?;
            Err(e)
        }
    }
}

/// What `finalize` observed. Only `Completed` means the dispatcher ran.
#[derive(Debug)]
pub enum FinalizeResult {
    Completed(Payment),
    Failed(Payment),
    Duplicate(TransactionStatus),
    Expired,
}

#[derive(Debug)]
pub enum SettlementOutcome {
    Paid {
        settlement: SettlementInfo,
    },
    Failed {
        result_code: i64,
        result_desc: String,
    },
}

/// What the pre-update check decided for an incoming settlement result.
#[derive(Debug, PartialEq, Eq)]
enum FinalizeGate {
    /// Already terminal; acknowledge and do nothing.
    Duplicate(TransactionStatus),
    /// Past the payment window; terminalize as expired, never dispatch.
    Expire,
    /// Still active; contend for the conditional update.
    Proceed,
}

fn finalize_gate(payment: &Payment, now: chrono::DateTime<chrono::Utc>) -> FinalizeGate {
    if payment.status.is_terminal() {
        FinalizeGate::Duplicate(payment.status)
    } else if payment.is_expired_at(now) {
        FinalizeGate::Expire
    } else {
        FinalizeGate::Proceed
    }
}

fn settlement_update(
    outcome: &SettlementOutcome,
    from_callback: bool,
    now: chrono::DateTime<chrono::Utc>,
) -> Document {
    match outcome {
        SettlementOutcome::Paid { settlement } => {
            let mut set = doc! {
                "status": "completed",
                "completed_at": now.to_rfc3339(),
                "result_code": 0i64,
                "result_desc": "Success",
                "callback_received": from_callback,
            };
            if let Some(receipt) = &settlement.receipt_number {
                set.insert("mpesa_receipt_number", receipt.as_str());
            }
            doc! { "$set": set }
        }
        SettlementOutcome::Failed {
            result_code,
            result_desc,
        } => doc! { "$set": {
            "status": "failed",
            "result_code": *result_code,
            "result_desc": result_desc.as_str(),
            "callback_received": from_callback,
        }},
    }
}

/// The single completion path shared by the callback receiver and the
/// poller. Whoever wins the conditional update runs the dispatcher;
/// everyone else observes a duplicate.
pub async fn finalize(
    state: &AppState,
    checkout_request_id: &str,
    outcome: SettlementOutcome,
    from_callback: bool,
) -> Result<FinalizeResult> {
    let collection = payments(state);

    let Some(payment) = collection
        .find_one(doc! { "checkout_request_id": checkout_request_id })
        .await?
    else {
        warn!("No transaction for checkout request {}", checkout_request_id);
        return Err(AppError::CallbackNotFound(checkout_request_id.to_string()));
    };

    match finalize_gate(&payment, Utc::now()) {
        FinalizeGate::Duplicate(status) => {
            info!(
                "Duplicate result for {} (already {})",
                checkout_request_id,
                status.as_str()
            );
            return Ok(FinalizeResult::Duplicate(status));
        }
        FinalizeGate::Expire => {
            expire_one(&collection, &payment).await?;
            warn!(
                "Late result for expired transaction {}; ignoring",
                checkout_request_id
            );
            return Ok(FinalizeResult::Expired);
        }
        FinalizeGate::Proceed => {}
    }

    let update = settlement_update(&outcome, from_callback, Utc::now());

    // Atomic gate: only one caller can move pending/processing -> terminal
    let finalized = collection
        .find_one_and_update(
            doc! {
                "checkout_request_id": checkout_request_id,
                "status": { "$in": ACTIVE_STATUSES.to_vec() },
            },
            update,
        )
        .return_document(ReturnDocument::After)
        .await?;

    let Some(finalized) = finalized else {
        // Lost the race against the other reconciliation path or the sweeper
        let status = collection
            .find_one(doc! { "checkout_request_id": checkout_request_id })
            .await?
            .map(|p| p.status)
            .unwrap_or(TransactionStatus::Failed);
        info!(
            "Result for {} raced to {}; treating as duplicate",
            checkout_request_id,
            status.as_str()
        );
        return Ok(FinalizeResult::Duplicate(status));
    };

    match finalized.status {
        TransactionStatus::Completed => {
            info!(
                "Payment {} completed, receipt {:?}",
                checkout_request_id, finalized.mpesa_receipt_number
            );
            // A dispatch failure must not un-complete the payment or make
            // the gateway retry; it is logged for manual follow-up.
            if let Err(e) = dispatcher::run_post_payment(state, &finalized).await {
                error!(
                    "Post-payment dispatch failed for {}: {}",
                    checkout_request_id, e
                );
            }
            // Re-read so the subscription snapshot lands in the response
            let refreshed = collection
                .find_one(doc! { "checkout_request_id": checkout_request_id })
                .await?
                .unwrap_or(finalized);
            Ok(FinalizeResult::Completed(refreshed))
        }
        _ => {
            info!(
                "Payment {} failed: {:?}",
                checkout_request_id, finalized.result_desc
            );
            Ok(FinalizeResult::Failed(finalized))
        }
    }
}

/// Result code 0 is the gateway's only success signal; everything else
/// carries a failure reason.
pub fn outcome_from_callback(callback: &StkCallback) -> SettlementOutcome {
    if callback.result_code == 0 {
        SettlementOutcome::Paid {
            settlement: callback.settlement_info(),
        }
    } else {
        SettlementOutcome::Failed {
            result_code: callback.result_code,
            result_desc: callback.result_desc.clone(),
        }
    }
}

/// Webhook entry: maps the gateway's native callback onto the shared path.
pub async fn apply_callback(state: &AppState, callback: &StkCallback) -> Result<FinalizeResult> {
    let outcome = outcome_from_callback(callback);
    finalize(state, &callback.checkout_request_id, outcome, true).await
}

/// On-demand reconciliation. Queries the gateway only for an unexpired
/// `processing` transaction; everything else returns the stored snapshot.
pub async fn poll_status(
    state: &AppState,
    payment_id: ObjectId,
    user_id: ObjectId,
) -> Result<Payment> {
    let collection = payments(state);

    let Some(payment) = collection
        .find_one(doc! { "_id": payment_id, "user_id": user_id })
        .await?
    else {
        return Err(AppError::TransactionNotFound);
    };

    if payment.status.is_terminal() {
        return Ok(payment);
    }

    if payment.is_expired_at(Utc::now()) {
        expire_one(&collection, &payment).await?;
        return collection
            .find_one(doc! { "_id": payment_id })
            .await?
            .ok_or(AppError::TransactionNotFound);
    }

    let Some(checkout_request_id) = payment.checkout_request_id.clone() else {
        // Still pending: the gateway never acknowledged the charge
        return Ok(payment);
    };

    use crate::services::mpesa_service::StkQueryOutcome;

    // With the gateway disabled there is nothing to reconcile against;
    // return the stored snapshot and let the sweeper handle expiry.
    let Ok(mpesa) = state.mpesa() else {
        return Ok(payment);
    };

    match mpesa.query_status(&checkout_request_id).await {
        Ok(StkQueryOutcome::StillPending) => Ok(payment),
        Ok(StkQueryOutcome::Success { settlement }) => {
            finalize(
                state,
                &checkout_request_id,
                SettlementOutcome::Paid { settlement },
                false,
            )
            .await?;
            collection
                .find_one(doc! { "_id": payment_id })
                .await?
                .ok_or(AppError::TransactionNotFound)
        }
        Ok(StkQueryOutcome::Failed { code, desc }) => {
            let result_code = code.parse::<i64>().unwrap_or(1);
            finalize(
                state,
                &checkout_request_id,
                SettlementOutcome::Failed {
                    result_code,
                    result_desc: desc,
                },
                false,
            )
            .await?;
            collection
                .find_one(doc! { "_id": payment_id })
                .await?
                .ok_or(AppError::TransactionNotFound)
        }
        Err(e) => {
            // Transport-level failure: the next poll retries, nothing changes
            warn!("Status query for {} failed: {}", checkout_request_id, e);
            Ok(payment)
        }
    }
}

/// Local cancel only; an in-flight STK prompt is not retracted.
pub async fn cancel(state: &AppState, payment_id: ObjectId, user_id: ObjectId) -> Result<Payment> {
    let collection = payments(state);

    let cancelled = collection
        .find_one_and_update(
            doc! {
                "_id": payment_id,
                "user_id": user_id,
                "status": { "$in": ACTIVE_STATUSES.to_vec() },
            },
            doc! { "$set": { "status": "cancelled", "result_desc": "Cancelled by user" } },
        )
        .return_document(ReturnDocument::After)
        .await?;

    match cancelled {
        Some(payment) => {
            info!("Payment {} cancelled by user", payment_id);
            Ok(payment)
        }
        None => {
            let existing = collection
                .find_one(doc! { "_id": payment_id, "user_id": user_id })
                .await?
                .ok_or(AppError::TransactionNotFound)?;
            Err(AppError::StateConflict(existing.status.as_str().to_string()))
        }
    }
}

#[derive(Debug, Default)]
pub struct HistoryFilter {
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
    pub page: u64,
    pub limit: i64,
}

#[derive(Debug, serde::Serialize)]
pub struct HistoryPage {
    pub payments: Vec<Payment>,
    pub total: u64,
    pub page: u64,
    pub limit: i64,
}

pub async fn history(
    state: &AppState,
    user_id: ObjectId,
    filter: HistoryFilter,
) -> Result<HistoryPage> {
    let collection = payments(state);

    let mut query = doc! { "user_id": user_id };
    if let Some(status) = filter.status {
        query.insert("status", status.as_str());
    }
    if let Some(transaction_type) = filter.transaction_type {
        query.insert("transaction_type", transaction_type.as_str());
    }

    let (page, limit) = page_window(filter.page, filter.limit);

    let total = collection.count_documents(query.clone()).await?;
    let cursor = collection
        .find(query)
        .sort(doc! { "initiated_at": -1 })
        .skip((page - 1) * limit as u64)
        .limit(limit)
        .await?;
    let payments: Vec<Payment> = cursor.try_collect().await?;

    Ok(HistoryPage {
        payments,
        total,
        page,
        limit,
    })
}

/// Bounds client-supplied paging so the skip arithmetic cannot overflow.
fn page_window(page: u64, limit: i64) -> (u64, i64) {
    (page.clamp(1, 1_000_000), limit.clamp(1, 100))
}

/// TTL sweep: force-expires every active transaction past its window.
pub async fn sweep_expired(state: &AppState) -> Result<u64> {
    let collection = payments(state);

    let result = collection
        .update_many(
            doc! {
                "status": { "$in": ACTIVE_STATUSES.to_vec() },
                "expires_at": { "$lt": mongodb::bson::DateTime::from_chrono(Utc::now()) },
            },
            doc! { "$set": { "status": "expired", "result_desc": "Payment window elapsed" } },
        )
        .await?;

    if result.modified_count > 0 {
        info!("Expired {} stale transactions", result.modified_count);
    }
    Ok(result.modified_count)
}

async fn expire_one(collection: &Collection<Payment>, payment: &Payment) -> Result<()> {
    let Some(id) = payment.id else {
        return Ok(());
    };
    collection
        .update_one(
            doc! { "_id": id, "status": { "$in": ACTIVE_STATUSES.to_vec() } },
            doc! { "$set": { "status": "expired", "result_desc": "Payment window elapsed" } },
        )
        .await?;
    info!("Transaction {} expired", id);
    Ok(())
}

async fn mark_failed(
    collection: &Collection<Payment>,
    payment_id: ObjectId,
    result_code: Option<i64>,
    reason: &str,
) -> Result<()> {
    let mut set = doc! { "status": "failed", "result_desc": reason };
    if let Some(code) = result_code {
        set.insert("result_code", code);
    }
    collection
        .update_one(
            doc! { "_id": payment_id, "status": { "$in": ACTIVE_STATUSES.to_vec() } },
            doc! { "$set": set },
        )
        .await?;
    Ok(())
}

pub(crate) fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        *error.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref write_error)) if write_error.code == 11000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn processing_payment() -> Payment {
        let mut payment = Payment::new(
            ObjectId::new(),
            TransactionType::Subscription,
            5_000,
            "254712345678".to_string(),
            "MZG-TEST".to_string(),
            "Premium subscription".to_string(),
            None,
        );
        payment.status = TransactionStatus::Processing;
        payment.checkout_request_id = Some("ws_CO_191220191020363925".to_string());
        payment
    }

    #[test]
    fn active_transaction_proceeds_to_the_conditional_update() {
        let payment = processing_payment();
        assert_eq!(finalize_gate(&payment, Utc::now()), FinalizeGate::Proceed);
    }

    #[test]
    fn terminal_transaction_is_reported_as_duplicate() {
        for status in [
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Cancelled,
            TransactionStatus::Expired,
        ] {
            let mut payment = processing_payment();
            payment.status = status;
            assert_eq!(
                finalize_gate(&payment, Utc::now()),
                FinalizeGate::Duplicate(status)
            );
        }
    }

    #[test]
    fn late_result_past_the_window_expires_instead_of_dispatching() {
        let payment = processing_payment();
        let late = payment.expires_at + Duration::minutes(1);
        assert_eq!(finalize_gate(&payment, late), FinalizeGate::Expire);
    }

    #[test]
    fn paid_update_completes_and_records_the_receipt() {
        let now = Utc::now();
        let outcome = SettlementOutcome::Paid {
            settlement: SettlementInfo {
                amount: Some(5_000),
                receipt_number: Some("NLJ7RT61SV".to_string()),
                transaction_date: None,
                phone_number: Some("254712345678".to_string()),
            },
        };

        let update = settlement_update(&outcome, true, now);
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "completed");
        assert_eq!(set.get_str("mpesa_receipt_number").unwrap(), "NLJ7RT61SV");
        assert_eq!(set.get_str("completed_at").unwrap(), now.to_rfc3339());
        assert_eq!(set.get_i64("result_code").unwrap(), 0);
        assert!(set.get_bool("callback_received").unwrap());
    }

    #[test]
    fn paid_update_without_receipt_omits_the_field() {
        let outcome = SettlementOutcome::Paid {
            settlement: SettlementInfo {
                amount: None,
                receipt_number: None,
                transaction_date: None,
                phone_number: None,
            },
        };

        let update = settlement_update(&outcome, false, Utc::now());
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "completed");
        assert!(set.get("mpesa_receipt_number").is_none());
        assert!(!set.get_bool("callback_received").unwrap());
    }

    #[test]
    fn failed_update_carries_the_gateway_reason() {
        let outcome = SettlementOutcome::Failed {
            result_code: 1032,
            result_desc: "Request cancelled by user.".to_string(),
        };

        let update = settlement_update(&outcome, true, Utc::now());
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "failed");
        assert_eq!(set.get_i64("result_code").unwrap(), 1032);
        assert_eq!(
            set.get_str("result_desc").unwrap(),
            "Request cancelled by user."
        );
        assert!(set.get("completed_at").is_none());
    }

    #[test]
    fn paging_survives_absurd_client_input() {
        let (page, limit) = page_window(u64::MAX, i64::MAX);
        assert_eq!(page, 1_000_000);
        assert_eq!(limit, 100);
        // The skip computation history performs must not wrap
        assert_eq!((page - 1) * limit as u64, 99_999_900);

        let (page, limit) = page_window(0, 0);
        assert_eq!((page, limit), (1, 1));

        let (page, limit) = page_window(3, 20);
        assert_eq!((page, limit), (3, 20));
    }

    fn callback(result_code: i64, desc: &str) -> StkCallback {
        serde_json::from_value(serde_json::json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResultCode": result_code,
            "ResultDesc": desc,
        }))
        .unwrap()
    }

    #[test]
    fn zero_result_code_is_paid() {
        let outcome = outcome_from_callback(&callback(0, "The service request is processed successfully."));
        assert!(matches!(outcome, SettlementOutcome::Paid { .. }));
    }

    #[test]
    fn nonzero_result_code_carries_the_reason() {
        match outcome_from_callback(&callback(1032, "Request cancelled by user.")) {
            SettlementOutcome::Failed {
                result_code,
                result_desc,
            } => {
                assert_eq!(result_code, 1032);
                assert_eq!(result_desc, "Request cancelled by user.");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
