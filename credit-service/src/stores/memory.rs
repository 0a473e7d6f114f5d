//! In-memory store implementations used by tests.
//!
//! These mirror the uniqueness constraints of the Postgres schema so the
//! ledger's idempotency paths behave the same against either backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{
    CreditTransaction, FinancialStatus, NewCreditTransaction, Order, OrderStatus, PaymentUpdate,
    TransactionType,
};
use crate::stores::{LedgerStore, OrderStore, Reversal};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory ledger store.
#[derive(Default)]
pub struct MemoryLedgerStore {
    rows: Mutex<Vec<CreditTransaction>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, for assertions.
    pub fn all(&self) -> Vec<CreditTransaction> {
        lock(&self.rows).clone()
    }

    /// Rewrite a row's creation time, for exercising age-based sweeps.
    pub fn backdate(&self, transaction_id: Uuid, created_utc: DateTime<Utc>) {
        if let Some(row) = lock(&self.rows)
            .iter_mut()
            .find(|r| r.transaction_id == transaction_id)
        {
            row.created_utc = created_utc;
        }
    }

    fn violates_unique(rows: &[CreditTransaction], candidate: &NewCreditTransaction) -> bool {
        let order_id = match candidate.order_id {
            Some(id) => id,
            None => return false,
        };
        match candidate.transaction_type {
            TransactionType::Earned => rows.iter().any(|r| {
                r.user_id == candidate.user_id
                    && r.order_id == Some(order_id)
                    && r.transaction_type == TransactionType::Earned.as_str()
            }),
            TransactionType::ReservationPendingPayment => false,
            t if candidate.amount < Decimal::ZERO => rows.iter().any(|r| {
                r.user_id == candidate.user_id
                    && r.order_id == Some(order_id)
                    && r.transaction_type == t.as_str()
                    && r.amount < Decimal::ZERO
            }),
            _ => false,
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert(&self, tx: NewCreditTransaction) -> Result<CreditTransaction, AppError> {
        let mut rows = lock(&self.rows);
        if Self::violates_unique(&rows, &tx) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Duplicate {} transaction for user {} / order {:?}",
                tx.transaction_type,
                tx.user_id,
                tx.order_id
            )));
        }
        let inserted = CreditTransaction {
            transaction_id: Uuid::new_v4(),
            user_id: tx.user_id,
            amount: tx.amount,
            transaction_type: tx.transaction_type.as_str().to_string(),
            order_id: tx.order_id,
            reason: tx.reason,
            balance: tx.balance,
            created_utc: Utc::now(),
            expires_utc: tx.expires_utc,
            created_by: tx.created_by,
        };
        rows.push(inserted.clone());
        Ok(inserted)
    }

    async fn get(&self, transaction_id: Uuid) -> Result<Option<CreditTransaction>, AppError> {
        Ok(lock(&self.rows)
            .iter()
            .find(|r| r.transaction_id == transaction_id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, AppError> {
        let mut rows: Vec<CreditTransaction> = lock(&self.rows)
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(rows)
    }

    async fn find_earned(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<CreditTransaction>, AppError> {
        Ok(lock(&self.rows)
            .iter()
            .find(|r| {
                r.user_id == user_id
                    && r.order_id == Some(order_id)
                    && r.transaction_type == TransactionType::Earned.as_str()
            })
            .cloned())
    }

    async fn find_deduction(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Option<CreditTransaction>, AppError> {
        Ok(lock(&self.rows)
            .iter()
            .find(|r| {
                r.user_id == user_id
                    && r.order_id == Some(order_id)
                    && r.transaction_type == transaction_type.as_str()
                    && r.amount < Decimal::ZERO
            })
            .cloned())
    }

    async fn confirm_reservation(
        &self,
        transaction_id: Uuid,
        order_id: Uuid,
        new_balance: Decimal,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let mut rows = lock(&self.rows);
        let idx = rows.iter().position(|r| {
            r.transaction_id == transaction_id
                && r.transaction_type == TransactionType::ReservationPendingPayment.as_str()
        });
        let idx = match idx {
            Some(i) => i,
            None => return Ok(None),
        };
        let user_id = rows[idx].user_id;
        // Mirrors the partial unique index on used deductions per order.
        let duplicate = rows.iter().any(|r| {
            r.user_id == user_id
                && r.order_id == Some(order_id)
                && r.transaction_type == TransactionType::Used.as_str()
        });
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A used transaction already exists for order {}",
                order_id
            )));
        }
        let row = &mut rows[idx];
        row.transaction_type = TransactionType::Used.as_str().to_string();
        row.order_id = Some(order_id);
        row.balance = new_balance;
        Ok(Some(row.clone()))
    }

    async fn delete(&self, transaction_id: Uuid) -> Result<bool, AppError> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|r| r.transaction_id != transaction_id);
        Ok(rows.len() < before)
    }

    async fn reverse(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<Option<Reversal>, AppError> {
        let mut rows = lock(&self.rows);
        let original = match rows.iter().find(|r| r.transaction_id == transaction_id) {
            Some(r) => r.clone(),
            None => return Ok(None),
        };
        if original.is_reservation() {
            rows.retain(|r| r.transaction_id != transaction_id);
            return Ok(Some(Reversal::ReleasedHold(original)));
        }
        let current_balance: Decimal = rows
            .iter()
            .filter(|r| r.user_id == original.user_id)
            .map(|r| r.amount)
            .sum();
        let compensating = CreditTransaction {
            transaction_id: Uuid::new_v4(),
            user_id: original.user_id,
            amount: -original.amount,
            transaction_type: TransactionType::Adjustment.as_str().to_string(),
            order_id: original.order_id,
            reason: reason.to_string(),
            balance: current_balance - original.amount,
            created_utc: Utc::now(),
            expires_utc: None,
            created_by: None,
        };
        rows.push(compensating.clone());
        Ok(Some(Reversal::Compensated(compensating)))
    }

    async fn delete_reservations_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|r| !(r.is_reservation() && r.created_utc < cutoff));
        Ok((before - rows.len()) as u64)
    }
}

/// In-memory order store.
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<Uuid, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: Order) -> Result<Order, AppError> {
        lock(&self.orders).insert(order.order_id, order.clone());
        Ok(order)
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(lock(&self.orders).get(&order_id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Vec<Order>, AppError> {
        let mut orders: Vec<Order> = lock(&self.orders)
            .values()
            .filter(|o| o.payment_session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(orders)
    }

    async fn find_by_intent(&self, payment_intent_id: &str) -> Result<Option<Order>, AppError> {
        let mut orders: Vec<Order> = lock(&self.orders)
            .values()
            .filter(|o| o.payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(orders.into_iter().next())
    }

    async fn find_recoverable(
        &self,
        user_id: Option<Uuid>,
        guest_email: Option<&str>,
        total: Decimal,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Order>, AppError> {
        let mut candidates: Vec<Order> = lock(&self.orders)
            .values()
            .filter(|o| {
                o.order_status == OrderStatus::AwaitingPayment.as_str()
                    && o.payment_session_id.is_none()
                    && o.created_utc >= created_after
                    && o.total == total
                    && match user_id {
                        Some(uid) => o.user_id == Some(uid),
                        None => {
                            guest_email.is_some() && o.guest_email.as_deref() == guest_email
                        }
                    }
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(candidates.into_iter().next())
    }

    async fn assign_session(&self, order_id: Uuid, session_id: &str) -> Result<(), AppError> {
        if let Some(order) = lock(&self.orders).get_mut(&order_id) {
            order.payment_session_id = Some(session_id.to_string());
        }
        Ok(())
    }

    async fn apply_payment_update(
        &self,
        order_id: Uuid,
        update: PaymentUpdate,
    ) -> Result<Order, AppError> {
        let mut orders = lock(&self.orders);
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))?;
        order.payment_session_id = Some(update.payment_session_id);
        order.payment_intent_id = update.payment_intent_id;
        order.order_status = update.order_status.as_str().to_string();
        order.financial_status = update.financial_status.as_str().to_string();
        order.proof_status = update.proof_status;
        order.subtotal = update.subtotal;
        order.tax = update.tax;
        order.total = update.total;
        if let Some(email) = update.customer_email {
            order.customer_email = Some(email);
        }
        if let Some(shipping) = update.shipping {
            order.shipping = Some(shipping);
        }
        Ok(order.clone())
    }

    async fn set_credit_hold(
        &self,
        order_id: Uuid,
        credits_applied: Decimal,
        credit_transaction_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        if let Some(order) = lock(&self.orders).get_mut(&order_id) {
            order.credits_applied = credits_applied;
            order.credit_transaction_id = credit_transaction_id;
        }
        Ok(())
    }

    async fn clear_credit_hold(&self, order_id: Uuid) -> Result<(), AppError> {
        if let Some(order) = lock(&self.orders).get_mut(&order_id) {
            order.credits_applied = Decimal::ZERO;
            order.credit_transaction_id = None;
        }
        Ok(())
    }

    async fn abandoned_checkouts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, AppError> {
        let mut orders: Vec<Order> = lock(&self.orders)
            .values()
            .filter(|o| {
                o.order_status == OrderStatus::AwaitingPayment.as_str()
                    && o.payment_session_id.is_some()
                    && o.credits_applied > Decimal::ZERO
                    && o.created_utc < cutoff
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            a.payment_session_id
                .cmp(&b.payment_session_id)
                .then(a.created_utc.cmp(&b.created_utc))
        });
        Ok(orders)
    }

    async fn mark_payment_failed(&self, order_id: Uuid) -> Result<(), AppError> {
        if let Some(order) = lock(&self.orders).get_mut(&order_id) {
            order.order_status = OrderStatus::PaymentFailed.as_str().to_string();
            order.financial_status = FinancialStatus::Failed.as_str().to_string();
        }
        Ok(())
    }

    async fn mark_refunded(&self, order_id: Uuid) -> Result<(), AppError> {
        if let Some(order) = lock(&self.orders).get_mut(&order_id) {
            order.order_status = OrderStatus::Refunded.as_str().to_string();
            order.financial_status = FinancialStatus::Refunded.as_str().to_string();
        }
        Ok(())
    }
}
