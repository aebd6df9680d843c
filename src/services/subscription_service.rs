// services/subscription_service.rs
use chrono::Utc;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, to_bson};
use mongodb::{Collection, Database};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::models::subscription::{Plan, Subscription};
use crate::models::user::User;
use crate::services::notification_service::NotificationService;

pub const USERS_COLLECTION: &str = "users";

fn users(db: &Database) -> Collection<User> {
    db.collection(USERS_COLLECTION)
}

/// Starts (or replaces) the user's subscription term.
pub async fn activate(
    db: &Database,
    user_id: ObjectId,
    plan: Plan,
    days: i64,
) -> Result<Subscription> {
    let mut subscription = Subscription::default();
    subscription.activate(plan, days, Utc::now());

    let result = users(db)
        .update_one(
            doc! { "_id": user_id },
            doc! { "$set": {
                "subscription": to_bson(&subscription)?,
                "updated_at": mongodb::bson::DateTime::now(),
            }},
        )
        .await?;

    if result.matched_count == 0 {
        return Err(AppError::UserNotFound);
    }

    Ok(subscription)
}

/// Reads the subscription, lazily resetting a lapsed term to free/inactive
/// before returning it.
pub async fn load_current(db: &Database, user_id: ObjectId) -> Result<Subscription> {
    let collection = users(db);
    let user = collection
        .find_one(doc! { "_id": user_id })
        .await?
        .ok_or(AppError::UserNotFound)?;

    let mut subscription = user.subscription;
    if subscription.deactivate_if_expired(Utc::now()) {
        info!("Subscription for user {} lapsed; deactivating", user_id);
        collection
            .update_one(
                doc! { "_id": user_id },
                doc! { "$set": {
                    "subscription.plan": "free",
                    "subscription.status": "inactive",
                    "updated_at": mongodb::bson::DateTime::now(),
                }},
            )
            .await?;
    }

    Ok(subscription)
}

/// Flags accounts whose active term ends within the reminder window and
/// sends one SMS per term. The conditional flip of `reminder_sent` keeps a
/// concurrent scan from double-sending even if the job lease lapses.
pub async fn send_expiry_reminders(
    db: &Database,
    notifier: &Arc<NotificationService>,
) -> Result<u64> {
    let collection = users(db);
    let now = Utc::now();

    let cursor = collection
        .find(doc! {
            "subscription.status": "active",
            "subscription.reminder_sent": false,
        })
        .await?;
    let candidates: Vec<User> = cursor.try_collect().await?;

    let mut sent = 0u64;
    for user in candidates {
        if !user.subscription.is_expiring_soon(now) {
            continue;
        }
        let Some(user_id) = user.id else { continue };
        let Some(end_date) = user.subscription.end_date else {
            continue;
        };

        let claimed = collection
            .update_one(
                doc! { "_id": user_id, "subscription.reminder_sent": false },
                doc! { "$set": { "subscription.reminder_sent": true } },
            )
            .await?;

        if claimed.modified_count == 0 {
            continue;
        }

        let message = format!(
            "Your Mazingira {} subscription expires on {}. Renew to keep uninterrupted access.",
            user.subscription.plan.as_str(),
            end_date.format("%d %b %Y")
        );
        if let Err(e) = notifier.send_sms(&user.phone, &message).await {
            warn!("Expiry reminder to {} failed: {}", user.phone, e);
        }
        sent += 1;
    }

    if sent > 0 {
        info!("Sent {} subscription expiry reminders", sent);
    }
    Ok(sent)
}
