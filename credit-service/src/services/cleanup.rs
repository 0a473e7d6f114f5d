//! Reclamation jobs for stale checkout state.
//!
//! Both jobs are idempotent and safe to re-run: abandoned-checkout cleanup
//! reverses each held transaction exactly once (a second run finds no holds
//! left), and expired-reservation cleanup deletes by cutoff.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::models::Order;
use crate::services::ledger::CreditLedger;
use crate::stores::OrderStore;

/// Summary of one abandoned-checkout sweep.
#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    pub sessions_processed: u64,
    pub orders_touched: u64,
    pub credits_restored: Decimal,
    pub failures: u64,
}

pub struct CleanupService {
    orders: Arc<dyn OrderStore>,
    ledger: CreditLedger,
}

impl CleanupService {
    pub fn new(orders: Arc<dyn OrderStore>, ledger: CreditLedger) -> Self {
        Self { orders, ledger }
    }

    /// Reclaim credit held by checkouts that never completed payment.
    ///
    /// Orders still awaiting payment after `max_age_hours`, with a session
    /// assigned and credit applied, are grouped by session; each session's
    /// orders have their holds reversed and linkage cleared. A failure in
    /// one session is counted and logged but does not stop the sweep.
    #[instrument(skip(self))]
    pub async fn cleanup_abandoned_checkouts(
        &self,
        max_age_hours: i64,
    ) -> Result<CleanupReport, AppError> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let stale = self.orders.abandoned_checkouts(cutoff).await?;

        let mut by_session: BTreeMap<String, Vec<Order>> = BTreeMap::new();
        for order in stale {
            let session = match order.payment_session_id.clone() {
                Some(s) => s,
                None => continue,
            };
            by_session.entry(session).or_default().push(order);
        }

        let mut report = CleanupReport::default();
        for (session_id, orders) in by_session {
            report.sessions_processed += 1;
            match self.reclaim_session(&session_id, &orders).await {
                Ok(restored) => {
                    report.orders_touched += orders.len() as u64;
                    report.credits_restored += restored;
                }
                Err(e) => {
                    report.failures += 1;
                    error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to reclaim abandoned checkout session"
                    );
                }
            }
        }

        info!(
            sessions = report.sessions_processed,
            orders = report.orders_touched,
            restored = %report.credits_restored,
            failures = report.failures,
            "Abandoned checkout sweep complete"
        );
        Ok(report)
    }

    async fn reclaim_session(
        &self,
        session_id: &str,
        orders: &[Order],
    ) -> Result<Decimal, AppError> {
        let mut restored = Decimal::ZERO;
        for order in orders {
            let tx_id = match order.credit_transaction_id {
                Some(id) => id,
                None => {
                    warn!(
                        order_id = %order.order_id,
                        "Order holds credit with no transaction linkage, clearing only"
                    );
                    self.orders.clear_credit_hold(order.order_id).await?;
                    continue;
                }
            };

            match self
                .ledger
                .reverse(
                    tx_id,
                    &format!("Abandoned checkout session {}", session_id),
                )
                .await
            {
                Ok(outcome) => {
                    restored += outcome.restored;
                }
                // Another sweep or a cancellation already released it.
                Err(AppError::NotFound(_)) => {
                    info!(order_id = %order.order_id, "Hold already released");
                }
                Err(e) => return Err(e),
            }

            self.orders.clear_credit_hold(order.order_id).await?;
        }
        Ok(restored)
    }

    /// Delete pending reservations past their TTL. These were never linked
    /// to an order, so removal alone restores the user's summed balance.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_reservations(&self) -> Result<u64, AppError> {
        let deleted = self.ledger.purge_expired_reservations().await?;
        if deleted > 0 {
            info!(deleted = deleted, "Expired reservations removed");
        }
        Ok(deleted)
    }
}

impl CleanupReport {
    pub fn had_failures(&self) -> bool {
        self.failures > 0
    }
}
