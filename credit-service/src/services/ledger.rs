//! Store-credit ledger.
//!
//! The ledger is append-mostly: every movement of credit is a row, and a
//! user's balance is always the sum of their rows' signed amounts. The
//! `balance` column on each row is an audit snapshot, never read back for
//! arithmetic, so a wrong snapshot can not corrupt anyone's balance.

use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::{retry_store_call, RetryConfig};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{CreditTransaction, NewCreditTransaction, TransactionType};
use crate::services::metrics::{CREDITS_AWARDED, CREDITS_RESTORED, ERRORS_TOTAL};
use crate::stores::{LedgerStore, Reversal};

/// Flat earn rate applied to an order total.
pub fn earn_rate() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

/// Hard cap on any user's balance. Earn truncates at this ceiling.
pub fn balance_cap() -> Decimal {
    Decimal::new(100, 0)
}

/// How long a pending reservation may live before cleanup reclaims it.
pub const RESERVATION_TTL_HOURS: i64 = 24;

/// Balance plus full transaction history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub transactions: Vec<CreditTransaction>,
    /// False when the store could not be read and zeros were substituted.
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditValidation {
    pub valid: bool,
    pub balance: Decimal,
    pub max_applicable: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    pub deducted_amount: Decimal,
    pub new_balance: Decimal,
    pub already_confirmed: bool,
    pub transaction: CreditTransaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeductOutcome {
    pub new_balance: Decimal,
    pub already_deducted: bool,
    pub transaction: CreditTransaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarnOutcome {
    pub awarded: Decimal,
    pub balance: Decimal,
    pub limit_reached: bool,
    pub already_awarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub transaction: Option<CreditTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReversalOutcome {
    /// Credit value returned to the user's balance.
    pub restored: Decimal,
    /// True when a pending hold was released rather than compensated.
    pub released_hold: bool,
    pub transaction: CreditTransaction,
}

/// Award for an order total against the current balance. Returns the award
/// after cap truncation and whether the cap was hit.
fn compute_award(balance: Decimal, order_total: Decimal) -> (Decimal, bool) {
    let computed = (order_total * earn_rate()).round_dp(2);
    let limit_reached = balance + computed > balance_cap();
    let awarded = if limit_reached {
        (balance_cap() - balance).max(Decimal::ZERO)
    } else {
        computed
    };
    (awarded, limit_reached)
}

/// The credit ledger service.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    retry: RetryConfig,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn summed_balance(&self, user_id: Uuid) -> Result<Decimal, AppError> {
        let rows = self.store.list_for_user(user_id).await?;
        Ok(rows.iter().map(|r| r.amount).sum())
    }

    /// Balance and history. Never fails: if the store is unreachable the
    /// caller gets a zeroed summary marked unavailable, so a balance widget
    /// can render while checkout paths do their own strict reads.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn balance(&self, user_id: Uuid) -> BalanceSummary {
        let store = self.store.clone();
        let result = retry_store_call(&self.retry, "list_for_user", || {
            let store = store.clone();
            async move { store.list_for_user(user_id).await }
        })
        .await;

        match result {
            Ok(transactions) => BalanceSummary {
                user_id,
                balance: transactions.iter().map(|r| r.amount).sum(),
                transactions,
                available: true,
            },
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Balance read failed, returning zeroed summary");
                ERRORS_TOTAL.with_label_values(&["db_error"]).inc();
                BalanceSummary {
                    user_id,
                    balance: Decimal::ZERO,
                    transactions: Vec::new(),
                    available: false,
                }
            }
        }
    }

    /// Check whether applying `requested` credit to an order is allowed.
    /// Fails closed with a message rather than an error; guests are never
    /// eligible.
    pub async fn validate(
        &self,
        user_id: Option<Uuid>,
        order_subtotal: Decimal,
        requested: Decimal,
    ) -> Result<CreditValidation, AppError> {
        let user_id = match user_id {
            Some(id) => id,
            None => {
                return Ok(CreditValidation {
                    valid: false,
                    balance: Decimal::ZERO,
                    max_applicable: Decimal::ZERO,
                    message: Some("Credits are available to signed-in customers only".to_string()),
                })
            }
        };

        let balance = self.summed_balance(user_id).await?;
        let max_applicable = balance.min(order_subtotal).max(Decimal::ZERO);

        let message = if requested <= Decimal::ZERO {
            Some("Credit amount must be positive".to_string())
        } else if requested > order_subtotal {
            Some("Credit cannot exceed the order subtotal".to_string())
        } else if requested > balance {
            Some(format!("Insufficient credit: balance is {}", balance))
        } else {
            None
        };

        Ok(CreditValidation {
            valid: message.is_none(),
            balance,
            max_applicable,
            message,
        })
    }

    /// Place a hold of `amount` against the user's balance for a checkout
    /// session. The hold is a negative row, so it reduces the summed balance
    /// immediately; a second checkout cannot spend the same credit.
    #[instrument(skip(self, reason, session_id), fields(user_id = %user_id, amount = %amount))]
    pub async fn reserve(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reason: &str,
        session_id: &str,
    ) -> Result<CreditTransaction, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Reservation amount must be positive"
            )));
        }
        let balance = self.summed_balance(user_id).await?;
        if balance < amount {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Insufficient credit: balance {} < requested {}",
                balance,
                amount
            )));
        }

        let reservation = self
            .store
            .insert(NewCreditTransaction {
                user_id,
                amount: -amount,
                transaction_type: TransactionType::ReservationPendingPayment,
                order_id: None,
                reason: format!("{} (session {})", reason, session_id),
                balance,
                expires_utc: Some(Utc::now() + Duration::hours(RESERVATION_TTL_HOURS)),
                created_by: None,
            })
            .await?;

        info!(transaction_id = %reservation.transaction_id, "Credit reserved");
        Ok(reservation)
    }

    /// Realize a pending reservation as a `used` spend attached to an order.
    ///
    /// Idempotent: confirming an already-confirmed reservation for the same
    /// order is a no-op success. The same reservation confirmed against a
    /// different order is a conflict.
    #[instrument(skip(self), fields(transaction_id = %transaction_id, order_id = %order_id))]
    pub async fn confirm_reservation(
        &self,
        transaction_id: Uuid,
        order_id: Uuid,
    ) -> Result<ConfirmOutcome, AppError> {
        let existing = self
            .store
            .get(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction {} not found", transaction_id)))?;

        let new_balance = self.summed_balance(existing.user_id).await?;

        match self
            .store
            .confirm_reservation(transaction_id, order_id, new_balance)
            .await?
        {
            Some(transaction) => {
                info!(transaction_id = %transaction_id, "Reservation confirmed");
                Ok(ConfirmOutcome {
                    deducted_amount: -transaction.amount,
                    new_balance,
                    already_confirmed: false,
                    transaction,
                })
            }
            None => {
                // Lost a race or re-delivered webhook: re-read and decide.
                let current = self.store.get(transaction_id).await?.ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!("Transaction {} not found", transaction_id))
                })?;
                if current.transaction_type == TransactionType::Used.as_str()
                    && current.order_id == Some(order_id)
                {
                    return Ok(ConfirmOutcome {
                        deducted_amount: -current.amount,
                        new_balance,
                        already_confirmed: true,
                        transaction: current,
                    });
                }
                Err(AppError::Conflict(anyhow::anyhow!(
                    "Transaction {} is {} for order {:?}, cannot confirm for order {}",
                    transaction_id,
                    current.transaction_type,
                    current.order_id,
                    order_id
                )))
            }
        }
    }

    /// Release a pending reservation. Cancelling an absent reservation is a
    /// success (it may already have been cleaned up). Returns whether a row
    /// was actually deleted.
    #[instrument(skip(self, reason), fields(transaction_id = %transaction_id))]
    pub async fn cancel_reservation(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<bool, AppError> {
        match self.store.get(transaction_id).await? {
            None => Ok(false),
            Some(row) if row.is_reservation() => {
                let deleted = self.store.delete(transaction_id).await?;
                if deleted {
                    info!(
                        transaction_id = %transaction_id,
                        amount = %-row.amount,
                        reason = reason,
                        "Reservation cancelled"
                    );
                }
                Ok(deleted)
            }
            Some(row) => Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} is {}, not a pending reservation",
                transaction_id,
                row.transaction_type
            ))),
        }
    }

    /// Record a direct spend against an order, without a prior reservation.
    ///
    /// Idempotent per `(user, order, type)`: a re-delivered request finds the
    /// existing deduction and reports it instead of double-charging.
    #[instrument(skip(self, reason, created_by), fields(user_id = %user_id, order_id = %order_id, amount = %amount))]
    pub async fn deduct(
        &self,
        user_id: Uuid,
        amount: Decimal,
        order_id: Uuid,
        reason: String,
        transaction_type: TransactionType,
        created_by: Option<String>,
    ) -> Result<DeductOutcome, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Deduction amount must be positive"
            )));
        }

        if let Some(existing) = self
            .store
            .find_deduction(user_id, order_id, transaction_type)
            .await?
        {
            let new_balance = self.summed_balance(user_id).await?;
            return Ok(DeductOutcome {
                new_balance,
                already_deducted: true,
                transaction: existing,
            });
        }

        let balance = self.summed_balance(user_id).await?;
        if balance < amount {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Insufficient credit: balance {} < requested {}",
                balance,
                amount
            )));
        }

        let insert = self
            .store
            .insert(NewCreditTransaction {
                user_id,
                amount: -amount,
                transaction_type,
                order_id: Some(order_id),
                reason,
                balance: balance - amount,
                expires_utc: None,
                created_by,
            })
            .await;

        match insert {
            Ok(transaction) => Ok(DeductOutcome {
                new_balance: balance - amount,
                already_deducted: false,
                transaction,
            }),
            // A concurrent request won the insert; surface its row.
            Err(AppError::Conflict(_)) => {
                let existing = self
                    .store
                    .find_deduction(user_id, order_id, transaction_type)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(anyhow::anyhow!(
                            "Concurrent deduction for order {} not found on re-read",
                            order_id
                        ))
                    })?;
                let new_balance = self.summed_balance(user_id).await?;
                Ok(DeductOutcome {
                    new_balance,
                    already_deducted: true,
                    transaction: existing,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Award 5% of an order total, truncated so the balance never exceeds
    /// the cap. At most one earn per `(user, order)`.
    #[instrument(skip(self, created_by), fields(order_id = %order_id, order_total = %order_total))]
    pub async fn earn(
        &self,
        user_id: Option<Uuid>,
        order_id: Uuid,
        order_total: Decimal,
        created_by: Option<String>,
    ) -> Result<EarnOutcome, AppError> {
        let user_id = match user_id {
            Some(id) => id,
            None => {
                return Ok(EarnOutcome {
                    awarded: Decimal::ZERO,
                    balance: Decimal::ZERO,
                    limit_reached: false,
                    already_awarded: false,
                    message: Some("Guest orders do not earn credit".to_string()),
                    transaction: None,
                })
            }
        };

        if order_total <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Order total must be positive"
            )));
        }

        if let Some(existing) = self.store.find_earned(user_id, order_id).await? {
            let balance = self.summed_balance(user_id).await?;
            return Ok(EarnOutcome {
                awarded: existing.amount,
                balance,
                limit_reached: false,
                already_awarded: true,
                message: None,
                transaction: Some(existing),
            });
        }

        let balance = self.summed_balance(user_id).await?;
        let (awarded, limit_reached) = compute_award(balance, order_total);

        if awarded <= Decimal::ZERO {
            info!(user_id = %user_id, balance = %balance, "Balance at cap, no credit awarded");
            return Ok(EarnOutcome {
                awarded: Decimal::ZERO,
                balance,
                limit_reached,
                already_awarded: false,
                message: Some("Credit balance is at its limit".to_string()),
                transaction: None,
            });
        }

        // A concurrent earn may have landed during the balance read.
        if let Some(existing) = self.store.find_earned(user_id, order_id).await? {
            let balance = self.summed_balance(user_id).await?;
            return Ok(EarnOutcome {
                awarded: existing.amount,
                balance,
                limit_reached: false,
                already_awarded: true,
                message: None,
                transaction: Some(existing),
            });
        }

        let insert = self
            .store
            .insert(NewCreditTransaction {
                user_id,
                amount: awarded,
                transaction_type: TransactionType::Earned,
                order_id: Some(order_id),
                reason: format!("Earned 5% on order {}", order_id),
                balance: balance + awarded,
                expires_utc: None,
                created_by,
            })
            .await;

        match insert {
            Ok(transaction) => {
                CREDITS_AWARDED.inc_by(awarded.to_f64().unwrap_or(0.0));
                info!(awarded = %awarded, limit_reached = limit_reached, "Credit earned");
                Ok(EarnOutcome {
                    awarded,
                    balance: balance + awarded,
                    limit_reached,
                    already_awarded: false,
                    message: None,
                    transaction: Some(transaction),
                })
            }
            Err(AppError::Conflict(_)) => {
                let existing = self
                    .store
                    .find_earned(user_id, order_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(anyhow::anyhow!(
                            "Concurrent earn for order {} not found on re-read",
                            order_id
                        ))
                    })?;
                let balance = self.summed_balance(user_id).await?;
                Ok(EarnOutcome {
                    awarded: existing.amount,
                    balance,
                    limit_reached: false,
                    already_awarded: true,
                    message: None,
                    transaction: Some(existing),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Undo a transaction: a pending hold is deleted, a realized transaction
    /// gets a compensating `adjustment` for the inverse amount.
    #[instrument(skip(self, reason), fields(transaction_id = %transaction_id))]
    pub async fn reverse(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<ReversalOutcome, AppError> {
        match self.store.reverse(transaction_id, reason).await? {
            Some(Reversal::ReleasedHold(original)) => {
                let restored = -original.amount;
                CREDITS_RESTORED.inc_by(restored.to_f64().unwrap_or(0.0).max(0.0));
                Ok(ReversalOutcome {
                    restored,
                    released_hold: true,
                    transaction: original,
                })
            }
            Some(Reversal::Compensated(compensating)) => {
                if compensating.amount > Decimal::ZERO {
                    CREDITS_RESTORED.inc_by(compensating.amount.to_f64().unwrap_or(0.0));
                }
                Ok(ReversalOutcome {
                    restored: compensating.amount,
                    released_hold: false,
                    transaction: compensating,
                })
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Transaction {} not found",
                transaction_id
            ))),
        }
    }

    /// Record a manual adjustment (positive or negative).
    #[instrument(skip(self, reason), fields(user_id = %user_id, amount = %amount))]
    pub async fn adjust(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reason: String,
    ) -> Result<CreditTransaction, AppError> {
        if amount == Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Adjustment amount must be non-zero"
            )));
        }
        let balance = self.summed_balance(user_id).await?;
        self.store
            .insert(NewCreditTransaction {
                user_id,
                amount,
                transaction_type: TransactionType::Adjustment,
                order_id: None,
                reason,
                balance: balance + amount,
                expires_utc: None,
                created_by: None,
            })
            .await
    }

    /// Delete pending reservations older than the TTL. Returns the count.
    pub async fn purge_expired_reservations(&self) -> Result<u64, AppError> {
        let cutoff = Utc::now() - Duration::hours(RESERVATION_TTL_HOURS);
        self.store.delete_reservations_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn award_is_five_percent_of_total() {
        let (awarded, limit_reached) = compute_award(Decimal::ZERO, Decimal::new(5000, 2));
        assert_eq!(awarded, Decimal::new(250, 2));
        assert!(!limit_reached);
    }

    #[test]
    fn award_truncates_at_cap() {
        // $96 balance, $100 order: 5% would be $5 but only $4 fits.
        let (awarded, limit_reached) = compute_award(Decimal::new(96, 0), Decimal::new(100, 0));
        assert_eq!(awarded, Decimal::new(4, 0));
        assert!(limit_reached);
    }

    #[test]
    fn award_is_zero_at_cap() {
        let (awarded, limit_reached) = compute_award(balance_cap(), Decimal::new(100, 0));
        assert_eq!(awarded, Decimal::ZERO);
        assert!(limit_reached);
    }

    #[test]
    fn award_rounds_to_cents() {
        // 5% of $10.33 is $0.5165, rounded to $0.52.
        let (awarded, _) = compute_award(Decimal::ZERO, Decimal::new(1033, 2));
        assert_eq!(awarded, Decimal::new(52, 2));
    }
}
