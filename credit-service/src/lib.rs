//! Credit Service - store-credit ledger and payment-webhook reconciliation.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
pub mod stores;

pub use startup::{AppState, Application};
