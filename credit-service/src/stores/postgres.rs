//! Postgres-backed stores for credit-service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    CreditTransaction, FinancialStatus, NewCreditTransaction, Order, OrderStatus, PaymentUpdate,
    TransactionType,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::stores::{LedgerStore, OrderStore, Reversal};

const TRANSACTION_COLUMNS: &str = "transaction_id, user_id, amount, transaction_type, order_id, \
     reason, balance, created_utc, expires_utc, created_by";

const ORDER_COLUMNS: &str = "order_id, user_id, guest_email, payment_session_id, \
     payment_intent_id, order_status, financial_status, proof_status, is_reorder, \
     credits_applied, credit_transaction_id, subtotal, tax, total, customer_email, shipping, \
     created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "credit-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

/// Ledger store over the `credit_transactions` table.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, tx), fields(user_id = %tx.user_id, transaction_type = %tx.transaction_type))]
    async fn insert(&self, tx: NewCreditTransaction) -> Result<CreditTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        let transaction_id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, CreditTransaction>(
            "INSERT INTO credit_transactions \
                 (transaction_id, user_id, amount, transaction_type, order_id, reason, balance, expires_utc, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING transaction_id, user_id, amount, transaction_type, order_id, reason, balance, created_utc, expires_utc, created_by",
        )
        .bind(transaction_id)
        .bind(tx.user_id)
        .bind(tx.amount)
        .bind(tx.transaction_type.as_str())
        .bind(tx.order_id)
        .bind(&tx.reason)
        .bind(tx.balance)
        .bind(tx.expires_utc)
        .bind(&tx.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Duplicate {} transaction for user {} / order {:?}",
                    tx.transaction_type,
                    tx.user_id,
                    tx.order_id
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert transaction: {}", e)),
        })?;

        timer.observe_duration();

        info!(
            transaction_id = %inserted.transaction_id,
            amount = %inserted.amount,
            "Credit transaction recorded"
        );

        Ok(inserted)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get(&self, transaction_id: Uuid) -> Result<Option<CreditTransaction>, AppError> {
        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e)))?;

        Ok(row)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_for_user"])
            .start_timer();

        let rows = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 ORDER BY created_utc DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows)
    }

    async fn find_earned(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 AND order_id = $2 AND transaction_type = 'earned' \
             LIMIT 1"
        ))
        .bind(user_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find earned transaction: {}", e))
        })?;

        Ok(row)
    }

    async fn find_deduction(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        transaction_type: TransactionType,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 AND order_id = $2 AND transaction_type = $3 AND amount < 0 \
             LIMIT 1"
        ))
        .bind(user_id)
        .bind(order_id)
        .bind(transaction_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find deduction: {}", e))
        })?;

        Ok(row)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id, order_id = %order_id))]
    async fn confirm_reservation(
        &self,
        transaction_id: Uuid,
        order_id: Uuid,
        new_balance: Decimal,
    ) -> Result<Option<CreditTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirm_reservation"])
            .start_timer();

        // The type guard in WHERE makes a second confirmation match zero rows.
        let row = sqlx::query_as::<_, CreditTransaction>(
            "UPDATE credit_transactions \
             SET transaction_type = 'used', order_id = $2, balance = $3 \
             WHERE transaction_id = $1 AND transaction_type = 'reservation_pending_payment' \
             RETURNING transaction_id, user_id, amount, transaction_type, order_id, reason, balance, created_utc, expires_utc, created_by",
        )
        .bind(transaction_id)
        .bind(order_id)
        .bind(new_balance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "A used transaction already exists for order {}",
                    order_id
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to confirm reservation: {}", e)),
        })?;

        timer.observe_duration();

        Ok(row)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn delete(&self, transaction_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM credit_transactions WHERE transaction_id = $1")
            .bind(transaction_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete transaction: {}", e))
            })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, reason), fields(transaction_id = %transaction_id))]
    async fn reverse(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<Option<Reversal>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reverse_transaction"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let original = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE transaction_id = $1 FOR UPDATE"
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load transaction: {}", e))
        })?;

        let original = match original {
            Some(t) => t,
            None => {
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(None);
            }
        };

        // A hold that was never realized is simply released.
        if original.is_reservation() {
            sqlx::query("DELETE FROM credit_transactions WHERE transaction_id = $1")
                .bind(transaction_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to release hold: {}", e))
                })?;

            tx.commit().await.map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to commit reversal: {}", e))
            })?;

            timer.observe_duration();
            info!(transaction_id = %transaction_id, "Reservation hold released");
            return Ok(Some(Reversal::ReleasedHold(original)));
        }

        let current_balance: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions WHERE user_id = $1",
        )
        .bind(original.user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum balance: {}", e)))?;

        let compensating = sqlx::query_as::<_, CreditTransaction>(
            "INSERT INTO credit_transactions \
                 (transaction_id, user_id, amount, transaction_type, order_id, reason, balance) \
             VALUES ($1, $2, $3, 'adjustment', $4, $5, $6) \
             RETURNING transaction_id, user_id, amount, transaction_type, order_id, reason, balance, created_utc, expires_utc, created_by",
        )
        .bind(Uuid::new_v4())
        .bind(original.user_id)
        .bind(-original.amount)
        .bind(original.order_id)
        .bind(reason)
        .bind(current_balance - original.amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert compensation: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit reversal: {}", e))
        })?;

        timer.observe_duration();

        info!(
            transaction_id = %transaction_id,
            compensating_id = %compensating.transaction_id,
            amount = %compensating.amount,
            "Transaction reversed"
        );

        Ok(Some(Reversal::Compensated(compensating)))
    }

    #[instrument(skip(self))]
    async fn delete_reservations_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_expired_reservations"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM credit_transactions \
             WHERE transaction_type = 'reservation_pending_payment' AND created_utc < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to delete reservations: {}", e))
        })?;

        timer.observe_duration();

        Ok(result.rows_affected())
    }
}

/// Order store over the `orders` table.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip(self, order), fields(order_id = %order.order_id))]
    async fn insert(&self, order: Order) -> Result<Order, AppError> {
        let inserted = sqlx::query_as::<_, Order>(
            "INSERT INTO orders \
                 (order_id, user_id, guest_email, payment_session_id, payment_intent_id, \
                  order_status, financial_status, proof_status, is_reorder, credits_applied, \
                  credit_transaction_id, subtotal, tax, total, customer_email, shipping, created_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING order_id, user_id, guest_email, payment_session_id, payment_intent_id, \
                  order_status, financial_status, proof_status, is_reorder, credits_applied, \
                  credit_transaction_id, subtotal, tax, total, customer_email, shipping, created_utc",
        )
        .bind(order.order_id)
        .bind(order.user_id)
        .bind(&order.guest_email)
        .bind(&order.payment_session_id)
        .bind(&order.payment_intent_id)
        .bind(&order.order_status)
        .bind(&order.financial_status)
        .bind(&order.proof_status)
        .bind(order.is_reorder)
        .bind(order.credits_applied)
        .bind(order.credit_transaction_id)
        .bind(order.subtotal)
        .bind(order.tax)
        .bind(order.total)
        .bind(&order.customer_email)
        .bind(&order.shipping)
        .bind(order.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert order: {}", e)))?;

        Ok(inserted)
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let row = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get order: {}", e)))?;

        Ok(row)
    }

    #[instrument(skip(self))]
    async fn find_by_session(&self, session_id: &str) -> Result<Vec<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_session"])
            .start_timer();

        let rows = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE payment_session_id = $1 ORDER BY created_utc"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find orders by session: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows)
    }

    async fn find_by_intent(&self, payment_intent_id: &str) -> Result<Option<Order>, AppError> {
        let row = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE payment_intent_id = $1 ORDER BY created_utc LIMIT 1"
        ))
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find order by intent: {}", e))
        })?;

        Ok(row)
    }

    #[instrument(skip(self, guest_email))]
    async fn find_recoverable(
        &self,
        user_id: Option<Uuid>,
        guest_email: Option<&str>,
        total: Decimal,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Order>, AppError> {
        let row = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE order_status = 'awaiting_payment' \
               AND payment_session_id IS NULL \
               AND created_utc >= $1 \
               AND total = $2 \
               AND (($3::uuid IS NOT NULL AND user_id = $3) \
                    OR ($3::uuid IS NULL AND $4::varchar IS NOT NULL AND guest_email = $4)) \
             ORDER BY created_utc DESC \
             LIMIT 1"
        ))
        .bind(created_after)
        .bind(total)
        .bind(user_id)
        .bind(guest_email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find recoverable order: {}", e))
        })?;

        Ok(row)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn assign_session(&self, order_id: Uuid, session_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET payment_session_id = $2 WHERE order_id = $1")
            .bind(order_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to assign session: {}", e))
            })?;

        Ok(())
    }

    #[instrument(skip(self, update), fields(order_id = %order_id, order_status = %update.order_status))]
    async fn apply_payment_update(
        &self,
        order_id: Uuid,
        update: PaymentUpdate,
    ) -> Result<Order, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_payment_update"])
            .start_timer();

        let row = sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders SET \
                 payment_session_id = $2, \
                 payment_intent_id = $3, \
                 order_status = $4, \
                 financial_status = $5, \
                 proof_status = $6, \
                 subtotal = $7, \
                 tax = $8, \
                 total = $9, \
                 customer_email = COALESCE($10, customer_email), \
                 shipping = COALESCE($11, shipping) \
             WHERE order_id = $1 \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order_id)
        .bind(&update.payment_session_id)
        .bind(&update.payment_intent_id)
        .bind(update.order_status.as_str())
        .bind(update.financial_status.as_str())
        .bind(&update.proof_status)
        .bind(update.subtotal)
        .bind(update.tax)
        .bind(update.total)
        .bind(&update.customer_email)
        .bind(&update.shipping)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to apply payment update: {}", e))
        })?;

        timer.observe_duration();

        row.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))
    }

    async fn set_credit_hold(
        &self,
        order_id: Uuid,
        credits_applied: Decimal,
        credit_transaction_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE orders SET credits_applied = $2, credit_transaction_id = $3 WHERE order_id = $1",
        )
        .bind(order_id)
        .bind(credits_applied)
        .bind(credit_transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set credit hold: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn clear_credit_hold(&self, order_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE orders SET credits_applied = 0, credit_transaction_id = NULL WHERE order_id = $1",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to clear credit hold: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn abandoned_checkouts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["abandoned_checkouts"])
            .start_timer();

        let rows = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE order_status = 'awaiting_payment' \
               AND payment_session_id IS NOT NULL \
               AND credits_applied > 0 \
               AND created_utc < $1 \
             ORDER BY payment_session_id, created_utc"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to scan abandoned checkouts: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn mark_payment_failed(&self, order_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET order_status = $2, financial_status = $3 WHERE order_id = $1")
            .bind(order_id)
            .bind(OrderStatus::PaymentFailed.as_str())
            .bind(FinancialStatus::Failed.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to mark payment failed: {}", e))
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn mark_refunded(&self, order_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET order_status = $2, financial_status = $3 WHERE order_id = $1")
            .bind(order_id)
            .bind(OrderStatus::Refunded.as_str())
            .bind(FinancialStatus::Refunded.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to mark refunded: {}", e))
            })?;

        Ok(())
    }
}
