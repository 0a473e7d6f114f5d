//! Business services for credit-service.

pub mod cleanup;
pub mod ledger;
pub mod metrics;
pub mod reconciler;
pub mod side_effects;
pub mod stripe;
