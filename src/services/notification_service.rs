// services/notification_service.rs
use reqwest::Client;
use std::sync::Arc;
use tracing::{error, info};

use crate::errors::{AppError, Result};

/// SMS delivery through Africa's Talking. Payment-flow callers go through
/// the `spawn_*` helpers so a slow or failing provider can never block or
/// fail a payment.
#[derive(Clone)]
pub struct NotificationService {
    api_key: String,
    username: String,
    from: String,
    client: Client,
}

impl NotificationService {
    pub fn new(api_key: String, username: String, from: String) -> Self {
        Self {
            api_key,
            username,
            from,
            client: Client::new(),
        }
    }

    pub async fn send_sms(&self, phone: &str, message: &str) -> Result<()> {
        let url = "https://api.africastalking.com/version1/messaging";

        let response = self
            .client
            .post(url)
            .header("apiKey", &self.api_key)
            .header("Accept", "application/json")
            .form(&[
                ("username", self.username.as_str()),
                ("to", phone),
                ("message", message),
                ("from", self.from.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::ExternalApi(format!("SMS API error: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::ExternalApi(format!(
                "SMS sending failed with status: {}",
                response.status()
            )))
        }
    }

    /// Fire-and-forget: logs delivery failures and moves on.
    pub fn spawn_sms(self: &Arc<Self>, phone: String, message: String) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            match notifier.send_sms(&phone, &message).await {
                Ok(()) => info!("SMS dispatched to {}", phone),
                Err(e) => error!("SMS to {} failed: {}", phone, e),
            }
        });
    }

    pub fn spawn_subscription_confirmation(
        self: &Arc<Self>,
        phone: String,
        plan: &str,
        end_date: chrono::DateTime<chrono::Utc>,
    ) {
        let message = format!(
            "Your Mazingira {} subscription is now active until {}. Thank you.",
            plan,
            end_date.format("%d %b %Y")
        );
        self.spawn_sms(phone, message);
    }

    pub fn spawn_inspection_request(self: &Arc<Self>, phone: String, reference: String) {
        let message = format!(
            "Inspection fee received (ref {}). Our team will contact you to schedule the visit.",
            reference
        );
        self.spawn_sms(phone, message);
    }
}
