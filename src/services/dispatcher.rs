// services/dispatcher.rs
//
// Side effects of a completed payment, keyed on transaction type. Reached
// only through the winning conditional update in payment_service::finalize,
// so each transaction dispatches at most once.
use mongodb::bson::doc;
use mongodb::Collection;
use tracing::{info, warn};

use crate::errors::Result;
use crate::models::payment::{Payment, TransactionType};
use crate::models::subscription::{Plan, SUBSCRIPTION_TERM_DAYS};
use crate::services::subscription_service;
use crate::state::AppState;

/// Paid amount decides the tier; the term is always 30 days.
pub fn plan_for_amount(amount: i64) -> Plan {
    if amount >= 10_000 {
        Plan::Enterprise
    } else if amount >= 5_000 {
        Plan::Premium
    } else {
        Plan::Basic
    }
}

pub async fn run_post_payment(state: &AppState, payment: &Payment) -> Result<()> {
    match payment.transaction_type {
        TransactionType::ResourceFee => activate_resource(state, payment).await,
        TransactionType::Subscription => activate_subscription(state, payment).await,
        TransactionType::InspectionFee => {
            state
                .notifier
                .spawn_inspection_request(payment.phone_number.clone(), payment.account_reference.clone());
            info!(
                "Inspection scheduling requested for payment {}",
                payment.account_reference
            );
            Ok(())
        }
        TransactionType::Other => {
            info!(
                "No side effect for payment {} (type other)",
                payment.account_reference
            );
            Ok(())
        }
    }
}

/// Flips the paid-for resource to active. Entity types map onto their
/// collections; anything unknown is logged and skipped.
async fn activate_resource(state: &AppState, payment: &Payment) -> Result<()> {
    let Some(related) = &payment.related_entity else {
        warn!(
            "Resource-fee payment {} has no related entity",
            payment.account_reference
        );
        return Ok(());
    };

    let collection_name = match related.entity_type.as_str() {
        "plant" => "plants",
        "permit" => "permits",
        "lab_sample" => "lab_samples",
        other => {
            warn!("Unknown related entity type '{}'; skipping activation", other);
            return Ok(());
        }
    };

    let collection: Collection<mongodb::bson::Document> = state.db.collection(collection_name);
    let result = collection
        .update_one(
            doc! { "_id": related.entity_id },
            doc! { "$set": {
                "status": "active",
                "payment_verified": true,
                "activated_at": mongodb::bson::DateTime::now(),
            }},
        )
        .await?;

    if result.matched_count == 0 {
        warn!(
            "Related {} {} not found for payment {}",
            related.entity_type, related.entity_id, payment.account_reference
        );
    } else {
        info!(
            "Activated {} {} for payment {}",
            related.entity_type, related.entity_id, payment.account_reference
        );
    }
    Ok(())
}

async fn activate_subscription(state: &AppState, payment: &Payment) -> Result<()> {
    let plan = plan_for_amount(payment.amount);
    let subscription =
        subscription_service::activate(&state.db, payment.user_id, plan, SUBSCRIPTION_TERM_DAYS)
            .await?;

    // Snapshot the resulting term back onto the transaction record
    if let Some(payment_id) = payment.id {
        let collection: Collection<Payment> = state.db.collection(super::payment_service::PAYMENTS_COLLECTION);
        collection
            .update_one(
                doc! { "_id": payment_id },
                doc! { "$set": {
                    "subscription_plan": plan.as_str(),
                    "subscription_start": subscription.start_date.map(|d| d.to_rfc3339()),
                    "subscription_end": subscription.end_date.map(|d| d.to_rfc3339()),
                }},
            )
            .await?;
    }

    if let Some(end_date) = subscription.end_date {
        state.notifier.spawn_subscription_confirmation(
            payment.phone_number.clone(),
            plan.as_str(),
            end_date,
        );
    }

    info!(
        "Subscription {} activated for user {} via payment {}",
        plan.as_str(),
        payment.user_id,
        payment.account_reference
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_thresholds() {
        assert_eq!(plan_for_amount(12_000), Plan::Enterprise);
        assert_eq!(plan_for_amount(10_000), Plan::Enterprise);
        assert_eq!(plan_for_amount(9_999), Plan::Premium);
        assert_eq!(plan_for_amount(5_000), Plan::Premium);
        assert_eq!(plan_for_amount(4_999), Plan::Basic);
        assert_eq!(plan_for_amount(1_500), Plan::Basic);
        assert_eq!(plan_for_amount(1_000), Plan::Basic);
        assert_eq!(plan_for_amount(1), Plan::Basic);
    }
}
