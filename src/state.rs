use mongodb::Database;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::services::mpesa_service::MpesaService;
use crate::services::notification_service::NotificationService;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: AppConfig,
    pub mpesa: Option<Arc<MpesaService>>,
    pub notifier: Arc<NotificationService>,
}

impl AppState {
    pub fn new(db: Database, config: AppConfig, notifier: Arc<NotificationService>) -> Self {
        AppState {
            db,
            config,
            mpesa: None,
            notifier,
        }
    }

    pub fn with_mpesa(mut self, mpesa: Arc<MpesaService>) -> Self {
        self.mpesa = Some(mpesa);
        self
    }

    pub fn mpesa(&self) -> Result<&MpesaService> {
        self.mpesa
            .as_deref()
            .ok_or_else(|| AppError::ServiceUnavailable("M-Pesa service is not available".to_string()))
    }
}
