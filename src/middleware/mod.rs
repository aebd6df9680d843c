pub mod auth;
pub mod callback_origin;
