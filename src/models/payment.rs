// models/payment.rs
use chrono::{DateTime, Duration, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::models::subscription::Plan;

pub const MIN_AMOUNT: i64 = 1;
pub const MAX_AMOUNT: i64 = 70_000;

/// STK prompts die on the handset after a few minutes; 15 gives the
/// callback and the poller room before the sweeper takes over.
pub const PAYMENT_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::Cancelled
                | TransactionStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    #[serde(rename = "resource-fee")]
    ResourceFee,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "inspection-fee")]
    InspectionFee,
    #[serde(rename = "other")]
    Other,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::ResourceFee => "resource-fee",
            TransactionType::Subscription => "subscription",
            TransactionType::InspectionFee => "inspection-fee",
            TransactionType::Other => "other",
        }
    }
}

/// Points at the resource a successful payment activates (plant, permit, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub entity_type: String,
    pub entity_id: ObjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: ObjectId,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub phone_number: String,
    pub status: TransactionStatus,

    // Assigned once the gateway accepts the charge
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,

    // Success only
    pub mpesa_receipt_number: Option<String>,

    pub account_reference: String,
    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_entity: Option<RelatedEntity>,

    pub callback_received: bool,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,

    // Snapshot written back by the dispatcher on subscription payments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_end: Option<DateTime<Utc>>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub initiated_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new(
        user_id: ObjectId,
        transaction_type: TransactionType,
        amount: i64,
        phone_number: String,
        account_reference: String,
        description: String,
        related_entity: Option<RelatedEntity>,
    ) -> Self {
        let now = Utc::now();
        Payment {
            id: Some(ObjectId::new()),
            user_id,
            transaction_type,
            amount,
            phone_number,
            status: TransactionStatus::Pending,
            merchant_request_id: None,
            checkout_request_id: None,
            mpesa_receipt_number: None,
            account_reference,
            description,
            related_entity,
            callback_received: false,
            result_code: None,
            result_desc: None,
            subscription_plan: None,
            subscription_start: None,
            subscription_end: None,
            initiated_at: now,
            expires_at: now + Duration::minutes(PAYMENT_WINDOW_MINUTES),
            completed_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }
}

pub fn validate_amount(amount: i64) -> Result<()> {
    if !(MIN_AMOUNT..=MAX_AMOUNT).contains(&amount) {
        return Err(AppError::InvalidAmount(amount));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Processing.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Cancelled.is_terminal());
        assert!(TransactionStatus::Expired.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TransactionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let parsed: TransactionStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(parsed, TransactionStatus::Processing);
    }

    #[test]
    fn transaction_type_wire_values() {
        assert_eq!(
            serde_json::to_string(&TransactionType::ResourceFee).unwrap(),
            "\"resource-fee\""
        );
        let parsed: TransactionType = serde_json::from_str("\"inspection-fee\"").unwrap();
        assert_eq!(parsed, TransactionType::InspectionFee);
    }

    #[test]
    fn amount_bounds() {
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(-5).is_err());
        assert!(validate_amount(70_001).is_err());
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(70_000).is_ok());
        assert!(validate_amount(5_000).is_ok());
    }

    #[test]
    fn new_payment_gets_fifteen_minute_window() {
        let payment = Payment::new(
            ObjectId::new(),
            TransactionType::Subscription,
            5_000,
            "254712345678".to_string(),
            "SUB-TEST".to_string(),
            "Premium subscription".to_string(),
            None,
        );
        assert_eq!(payment.status, TransactionStatus::Pending);
        assert_eq!(
            payment.expires_at - payment.initiated_at,
            Duration::minutes(15)
        );
        assert!(!payment.callback_received);
        assert!(payment.completed_at.is_none());
    }

    #[test]
    fn expiry_check_ignores_terminal_statuses() {
        let mut payment = Payment::new(
            ObjectId::new(),
            TransactionType::Other,
            100,
            "254712345678".to_string(),
            "REF".to_string(),
            "desc".to_string(),
            None,
        );
        let later = payment.expires_at + Duration::minutes(1);
        assert!(payment.is_expired_at(later));

        payment.status = TransactionStatus::Completed;
        assert!(!payment.is_expired_at(later));
    }
}
