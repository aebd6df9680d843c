// jobs/mod.rs
//
// Periodic work: the TTL sweep that force-expires stale transactions and
// the subscription expiry-reminder scan. Each tick takes a lease in the
// `job_locks` collection first, so running several instances of the
// service cannot run the same job concurrently.
use chrono::{Duration as ChronoDuration, Utc};
use mongodb::bson::{doc, DateTime, Document};
use mongodb::{Collection, Database};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::services::{payment_service, subscription_service};
use crate::state::AppState;

const LOCKS_COLLECTION: &str = "job_locks";

const EXPIRY_SWEEP_INTERVAL_SECS: u64 = 60;
const REMINDER_SCAN_INTERVAL_SECS: u64 = 3_600;

pub fn spawn_background_jobs(state: AppState) {
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(EXPIRY_SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !acquire_lease(&sweep_state.db, "expiry_sweep", EXPIRY_SWEEP_INTERVAL_SECS).await {
                continue;
            }
            match payment_service::sweep_expired(&sweep_state).await {
                Ok(count) if count > 0 => info!("Expiry sweep terminalized {} transactions", count),
                Ok(_) => {}
                Err(e) => error!("Expiry sweep failed: {}", e),
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(REMINDER_SCAN_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !acquire_lease(&state.db, "reminder_scan", REMINDER_SCAN_INTERVAL_SECS).await {
                continue;
            }
            match subscription_service::send_expiry_reminders(&state.db, &state.notifier).await {
                Ok(count) if count > 0 => info!("Reminder scan sent {} messages", count),
                Ok(_) => {}
                Err(e) => error!("Reminder scan failed: {}", e),
            }
        }
    });

    info!("Background jobs scheduled (expiry sweep, reminder scan)");
}

/// Lease acquisition via conditional upsert: the update only matches an
/// expired lease, and the unique `_id` turns a concurrent upsert into a
/// duplicate-key error for the loser.
async fn acquire_lease(db: &Database, job_name: &str, ttl_secs: u64) -> bool {
    let locks: Collection<Document> = db.collection(LOCKS_COLLECTION);
    let now = Utc::now();
    let lease_until = DateTime::from_chrono(now + ChronoDuration::seconds(ttl_secs as i64));

    let result = locks
        .update_one(
            doc! { "_id": job_name, "expires_at": { "$lt": DateTime::from_chrono(now) } },
            doc! { "$set": { "expires_at": lease_until } },
        )
        .upsert(true)
        .await;

    match result {
        Ok(r) => r.modified_count > 0 || r.upserted_id.is_some(),
        Err(e) if payment_service::is_duplicate_key(&e) => false,
        Err(e) => {
            warn!("Lease check for {} failed: {}", job_name, e);
            false
        }
    }
}
