//! Domain models for credit-service.

mod order;
mod transaction;

pub use order::*;
pub use transaction::*;
