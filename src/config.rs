// config.rs
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_callback_url: String,
    pub mpesa_environment: String,
    pub jwt_secret: String,
    pub database_url: String,
    pub port: u16,
    pub host: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mpesa_environment =
            env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string());

        AppConfig {
            mpesa_consumer_key: env::var("MPESA_CONSUMER_KEY")
                .expect("MPESA_CONSUMER_KEY must be set"),
            mpesa_consumer_secret: env::var("MPESA_CONSUMER_SECRET")
                .expect("MPESA_CONSUMER_SECRET must be set"),
            mpesa_short_code: env::var("MPESA_SHORT_CODE")
                .expect("MPESA_SHORT_CODE must be set"),
            mpesa_passkey: env::var("MPESA_PASSKEY")
                .expect("MPESA_PASSKEY must be set"),
            mpesa_callback_url: env::var("MPESA_CALLBACK_URL")
                .expect("MPESA_CALLBACK_URL must be set"),
            mpesa_environment,
            jwt_secret: env::var("JWT_SECRET")
                .expect("JWT_SECRET must be set"),
            database_url: env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set"),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("PORT must be a number"),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        }
    }

    pub fn get_mpesa_urls(&self) -> (String, String, String) {
        let base_url = if self.is_production() {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        };

        let auth_url = format!("{}/oauth/v1/generate?grant_type=client_credentials", base_url);
        let stk_push_url = format!("{}/mpesa/stkpush/v1/processrequest", base_url);
        let stk_query_url = format!("{}/mpesa/stkpushquery/v1/query", base_url);

        (auth_url, stk_push_url, stk_query_url)
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }
}
