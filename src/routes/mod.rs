pub(crate) mod payments;
pub(crate) mod subscriptions;
