//! HTTP handlers for credit-service.

pub mod credits;
pub mod webhooks;
