//! Storage interfaces for the ledger and order stores.
//!
//! Both stores are injected into the services that use them, so the
//! Postgres implementations can be swapped for in-memory doubles in tests.
//! The uniqueness guarantees the ledger's idempotency depends on live here:
//! implementations must report duplicate inserts as [`AppError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{CreditTransaction, NewCreditTransaction, Order, PaymentUpdate, TransactionType};

pub mod memory;
pub mod postgres;

/// Result of a storage-side reversal.
#[derive(Debug, Clone)]
pub enum Reversal {
    /// A pending reservation was deleted; the hold is released without a
    /// compensating entry (it never reduced the summed balance as a spend).
    ReleasedHold(CreditTransaction),
    /// A realized transaction was compensated with an `adjustment` entry
    /// whose amount is the inverse of the original.
    Compensated(CreditTransaction),
}

/// Append-only transaction table behind the credit ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a ledger row. Duplicate `(user, order, type)` rows covered by
    /// the store's uniqueness constraints surface as `AppError::Conflict`.
    async fn insert(&self, tx: NewCreditTransaction) -> Result<CreditTransaction, AppError>;

    async fn get(&self, transaction_id: Uuid) -> Result<Option<CreditTransaction>, AppError>;

    /// All transactions for a user, newest first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, AppError>;

    /// Find an existing `earned` transaction for `(user, order)`.
    async fn find_earned(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<CreditTransaction>, AppError>;

    /// Find an existing negative transaction for `(user, order, type)`.
    async fn find_deduction(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Option<CreditTransaction>, AppError>;

    /// Atomically mutate a pending reservation into a `used` transaction
    /// attached to `order_id`. Returns `None` when no pending reservation
    /// with that id exists (absent, or already confirmed by a racer).
    async fn confirm_reservation(
        &self,
        transaction_id: Uuid,
        order_id: Uuid,
        new_balance: Decimal,
    ) -> Result<Option<CreditTransaction>, AppError>;

    /// Delete a row outright. Returns whether a row was deleted.
    async fn delete(&self, transaction_id: Uuid) -> Result<bool, AppError>;

    /// Atomic compensating operation: delete a pending reservation, or
    /// insert an `adjustment` inverting a realized transaction. `None` when
    /// the transaction does not exist.
    async fn reverse(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<Option<Reversal>, AppError>;

    /// Delete all pending reservations created before the cutoff.
    async fn delete_reservations_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Order persistence as seen by the reconciler and the reclamation jobs.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: Order) -> Result<Order, AppError>;

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, AppError>;

    /// All orders under a payment session (one external checkout session
    /// can correspond to multiple order rows).
    async fn find_by_session(&self, session_id: &str) -> Result<Vec<Order>, AppError>;

    async fn find_by_intent(&self, payment_intent_id: &str) -> Result<Option<Order>, AppError>;

    /// Find an awaiting-payment order with no session assigned, belonging
    /// to the given user or guest email, created after `created_after`,
    /// whose total matches to the cent. Used to recover orders whose
    /// session-id propagation failed at creation time.
    async fn find_recoverable(
        &self,
        user_id: Option<Uuid>,
        guest_email: Option<&str>,
        total: Decimal,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Order>, AppError>;

    /// Backfill a payment session id onto a recovered order.
    async fn assign_session(&self, order_id: Uuid, session_id: &str) -> Result<(), AppError>;

    /// Apply the payment-confirmation fields as a single atomic update.
    async fn apply_payment_update(
        &self,
        order_id: Uuid,
        update: PaymentUpdate,
    ) -> Result<Order, AppError>;

    /// Link a credit hold to an order (set by the checkout layer).
    async fn set_credit_hold(
        &self,
        order_id: Uuid,
        credits_applied: Decimal,
        credit_transaction_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    /// Zero `credits_applied` and drop the transaction linkage.
    async fn clear_credit_hold(&self, order_id: Uuid) -> Result<(), AppError>;

    /// Awaiting-payment orders older than the cutoff that still hold
    /// credit and have a payment session assigned.
    async fn abandoned_checkouts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, AppError>;

    async fn mark_payment_failed(&self, order_id: Uuid) -> Result<(), AppError>;

    async fn mark_refunded(&self, order_id: Uuid) -> Result<(), AppError>;
}
