use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};

use crate::errors::Result;
use crate::models::payment::Payment;
use crate::services::payment_service::PAYMENTS_COLLECTION;

pub async fn get_db_client(database_url: &str) -> Database {
    let client = Client::with_uri_str(database_url)
        .await
        .expect("Failed to connect to MongoDB");

    let db_name = "mazingira";
    let db = client.database(db_name);

    match db.list_collection_names().await {
        Ok(collections) => {
            tracing::info!("✅ Connected to database: {}", db_name);
            tracing::info!("📂 Collections found: {:?}", collections);
        }
        Err(e) => {
            tracing::error!("❌ Database '{}' may not exist or is inaccessible: {}", db_name, e);
        }
    }

    db
}

/// The partial unique index is what makes the one-active-transaction rule
/// hold under concurrent initiations; the pre-check in the service is only
/// there for a friendlier error.
pub async fn ensure_indexes(db: &Database) -> Result<()> {
    let payments = db.collection::<Payment>(PAYMENTS_COLLECTION);

    let one_active_per_user = IndexModel::builder()
        .keys(doc! { "user_id": 1 })
        .options(
            IndexOptions::builder()
                .unique(true)
                .name("one_active_tx_per_user".to_string())
                .partial_filter_expression(doc! {
                    "status": { "$in": ["pending", "processing"] }
                })
                .build(),
        )
        .build();

    let checkout_lookup = IndexModel::builder()
        .keys(doc! { "checkout_request_id": 1 })
        .options(
            IndexOptions::builder()
                .unique(true)
                .name("checkout_request_id_unique".to_string())
                .partial_filter_expression(doc! {
                    "checkout_request_id": { "$type": "string" }
                })
                .build(),
        )
        .build();

    let expiry_sweep = IndexModel::builder()
        .keys(doc! { "status": 1, "expires_at": 1 })
        .build();

    payments.create_index(one_active_per_user).await?;
    payments.create_index(checkout_lookup).await?;
    payments.create_index(expiry_sweep).await?;

    tracing::info!("✅ Payment indexes ensured");
    Ok(())
}
