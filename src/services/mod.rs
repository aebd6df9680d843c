pub mod dispatcher;
pub mod mpesa_service;
pub mod notification_service;
pub mod payment_service;
pub mod subscription_service;
