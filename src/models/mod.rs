pub mod mpesa;
pub mod payment;
pub mod subscription;
pub mod user;
