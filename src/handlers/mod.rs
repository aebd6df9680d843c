pub(crate) mod payment_handlers;
pub(crate) mod subscription_handlers;
