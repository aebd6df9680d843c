use axum::extract::State;
use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod config;
mod database;
mod errors;
mod handlers;
mod jobs;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use config::AppConfig;
use database::connection::{ensure_indexes, get_db_client};
use services::mpesa_service::MpesaService;
use services::notification_service::NotificationService;
use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AppConfig::from_env();
    let db = get_db_client(&config.database_url).await;

    if let Err(e) = ensure_indexes(&db).await {
        tracing::error!("❌ Failed to create indexes: {}", e);
        panic!("Failed to create indexes: {}", e);
    }

    let app_state = initialize_app_state(db, config.clone()).await;

    jobs::spawn_background_jobs(app_state.clone());

    let app = build_router(app_state);
    start_server(app, &config).await;
}

async fn initialize_app_state(db: mongodb::Database, config: AppConfig) -> AppState {
    // SMS delivery config from environment
    let notifier = Arc::new(NotificationService::new(
        std::env::var("SMS_API_KEY").unwrap_or_default(),
        std::env::var("SMS_USERNAME").unwrap_or_else(|_| "sandbox".to_string()),
        std::env::var("SMS_FROM").unwrap_or_else(|_| "Mazingira".to_string()),
    ));

    let mut app_state = AppState::new(db, config.clone(), notifier);

    tracing::info!("🔧 Initializing M-Pesa service...");
    tracing::info!("📱 Short code: {}", config.mpesa_short_code);
    tracing::info!("🌐 Environment: {}", config.mpesa_environment);

    let mpesa = Arc::new(MpesaService::new(config));

    // Check the credentials up front; a broken gateway config should not
    // take the rest of the API down with it
    match mpesa.get_access_token().await {
        Ok(_) => {
            app_state = app_state.with_mpesa(mpesa);
            tracing::info!("✅ M-Pesa service initialized and ready");
        }
        Err(e) => {
            tracing::error!("❌ Failed to get M-Pesa access token: {}", e);
            tracing::warn!("M-Pesa service will be disabled");
        }
    }

    app_state
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/payments", routes::payments::payment_routes(app_state.clone()))
        .nest("/api/subscription", routes::subscriptions::subscription_routes(app_state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn start_server(app: Router, config: &AppConfig) {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    tracing::info!("🚀 Server starting on {}", addr);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        }
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "🌿 Mazingira Compliance API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    use mongodb::bson::doc;

    let db_status = match state.db.run_command(doc! {"ping": 1}).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "mpesa": state.mpesa.is_some(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
