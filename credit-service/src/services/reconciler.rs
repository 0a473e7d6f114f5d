//! Payment webhook reconciliation.
//!
//! The reconciler turns provider webhook events into order and ledger state.
//! It is written to be re-entrant: providers redeliver events, so every path
//! either no-ops on already-applied state or is idempotent at the store.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    FinancialStatus, Order, OrderStatus, PaymentUpdate, PROOF_APPROVED,
};
use crate::services::ledger::CreditLedger;
use crate::services::metrics::{REVERSAL_FAILURES, WEBHOOK_EVENTS_TOTAL};
use crate::services::side_effects::SideEffects;
use crate::stores::OrderStore;

/// How far back to search for an order when session linkage is missing.
const RECOVERY_WINDOW_HOURS: i64 = 1;

/// Pause before refetching a session whose expanded fields arrived empty.
const DEFAULT_REFETCH_DELAY: Duration = Duration::from_secs(2);

/// Proof preference carried on a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofPreference {
    Proof,
    NoProof,
}

#[derive(Debug, Clone)]
pub struct SessionLineItem {
    pub description: String,
    pub quantity: u32,
    pub proof_preference: ProofPreference,
}

/// A completed checkout session as reported by the payment provider,
/// normalized out of provider-specific DTOs.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    pub payment_status: String,
    pub user_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub amount_subtotal: Decimal,
    pub amount_tax: Decimal,
    pub amount_total: Decimal,
    pub line_items: Vec<SessionLineItem>,
    pub shipping: Option<serde_json::Value>,
    pub discount_code: Option<String>,
    pub discount_amount: Decimal,
}

/// Session lookups against the payment provider.
#[async_trait::async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn fetch_session(&self, session_id: &str) -> Result<CheckoutSession, AppError>;
}

/// A webhook event after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    CheckoutCompleted { session_id: String },
    PaymentSucceeded { payment_intent_id: String },
    PaymentFailed { payment_intent_id: String },
    ChargeRefunded { payment_intent_id: String },
    Ignored { event_type: String },
}

impl PaymentEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout.session.completed",
            Self::PaymentSucceeded { .. } => "payment_intent.succeeded",
            Self::PaymentFailed { .. } => "payment_intent.payment_failed",
            Self::ChargeRefunded { .. } => "charge.refunded",
            Self::Ignored { .. } => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The order under the event's session was updated.
    Processed { order_id: Uuid },
    /// No order carried the session id; one was recovered by matching
    /// user and total, and the session was backfilled onto it.
    Recovered { order_id: Uuid },
    /// No order could be matched to the event.
    NoMatch,
    /// The event required no action.
    Ignored,
}

pub struct WebhookReconciler {
    orders: Arc<dyn OrderStore>,
    ledger: CreditLedger,
    provider: Arc<dyn CheckoutProvider>,
    side_effects: SideEffects,
    refetch_delay: Duration,
}

impl WebhookReconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        ledger: CreditLedger,
        provider: Arc<dyn CheckoutProvider>,
        side_effects: SideEffects,
    ) -> Self {
        Self {
            orders,
            ledger,
            provider,
            side_effects,
            refetch_delay: DEFAULT_REFETCH_DELAY,
        }
    }

    pub fn with_refetch_delay(mut self, delay: Duration) -> Self {
        self.refetch_delay = delay;
        self
    }

    /// Dispatch a classified event.
    #[instrument(skip(self), fields(event = event.label()))]
    pub async fn handle(&self, event: PaymentEvent) -> Result<ReconcileOutcome, AppError> {
        let label = event.label();
        let result = match event {
            PaymentEvent::CheckoutCompleted { session_id } => {
                self.handle_checkout_completed(&session_id).await
            }
            PaymentEvent::PaymentSucceeded { payment_intent_id } => {
                // Informational: checkout.session.completed drives fulfillment.
                info!(payment_intent_id = %payment_intent_id, "Payment intent succeeded");
                Ok(ReconcileOutcome::Ignored)
            }
            PaymentEvent::PaymentFailed { payment_intent_id } => {
                self.handle_payment_failed(&payment_intent_id).await
            }
            PaymentEvent::ChargeRefunded { payment_intent_id } => {
                self.handle_refund(&payment_intent_id).await
            }
            PaymentEvent::Ignored { event_type } => {
                info!(event_type = %event_type, "Unhandled event type acknowledged");
                Ok(ReconcileOutcome::Ignored)
            }
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        WEBHOOK_EVENTS_TOTAL
            .with_label_values(&[label, status])
            .inc();
        result
    }

    /// Checkout completed: move the order out of awaiting-payment, realize
    /// any credit hold, then run the non-critical follow-ups.
    async fn handle_checkout_completed(
        &self,
        session_id: &str,
    ) -> Result<ReconcileOutcome, AppError> {
        let mut session = self.provider.fetch_session(session_id).await?;

        // Expanded fields sometimes lag right after completion.
        if session.line_items.is_empty() || session.shipping.is_none() {
            tokio::time::sleep(self.refetch_delay).await;
            session = self.provider.fetch_session(session_id).await?;
        }

        let (order, recovered) = match self.match_order(&session).await? {
            Some(pair) => pair,
            None => {
                warn!(session_id = %session_id, "No order matched completed checkout session");
                return Ok(ReconcileOutcome::NoMatch);
            }
        };

        let (order_status, proof_status) = route_for_proofing(&order, &session);

        let updated = self
            .orders
            .apply_payment_update(
                order.order_id,
                PaymentUpdate {
                    payment_session_id: session.session_id.clone(),
                    payment_intent_id: session.payment_intent_id.clone(),
                    order_status,
                    financial_status: FinancialStatus::Paid,
                    proof_status,
                    subtotal: session.amount_subtotal,
                    tax: session.amount_tax,
                    total: session.amount_total,
                    customer_email: session.customer_email.clone(),
                    shipping: session.shipping.clone(),
                },
            )
            .await?;

        // Credit realization is on the critical path: if this fails the
        // provider must redeliver the event.
        if let Some(tx_id) = updated.credit_transaction_id {
            if updated.credits_applied > Decimal::ZERO {
                let outcome = self
                    .ledger
                    .confirm_reservation(tx_id, updated.order_id)
                    .await?;
                if outcome.already_confirmed {
                    info!(order_id = %updated.order_id, "Credit already confirmed for order");
                }
            }
        }

        self.run_follow_ups(&updated, &session).await;

        info!(
            order_id = %updated.order_id,
            order_status = %updated.order_status,
            recovered = recovered,
            "Checkout session reconciled"
        );

        if recovered {
            Ok(ReconcileOutcome::Recovered {
                order_id: updated.order_id,
            })
        } else {
            Ok(ReconcileOutcome::Processed {
                order_id: updated.order_id,
            })
        }
    }

    /// Find the order for a session, falling back to recovery matching when
    /// the session id never landed on any order row.
    async fn match_order(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<(Order, bool)>, AppError> {
        let candidates = self.orders.find_by_session(&session.session_id).await?;
        if let Some(order) = candidates
            .into_iter()
            .find(|o| o.parsed_status() == OrderStatus::AwaitingPayment)
        {
            return Ok(Some((order, false)));
        }

        let created_after = Utc::now() - ChronoDuration::hours(RECOVERY_WINDOW_HOURS);
        let recovered = self
            .orders
            .find_recoverable(
                session.user_id,
                session.customer_email.as_deref(),
                session.amount_total,
                created_after,
            )
            .await?;

        match recovered {
            Some(order) => {
                warn!(
                    order_id = %order.order_id,
                    session_id = %session.session_id,
                    "Recovered order with missing session linkage"
                );
                self.orders
                    .assign_session(order.order_id, &session.session_id)
                    .await?;
                Ok(Some((order, true)))
            }
            None => Ok(None),
        }
    }

    /// Non-critical follow-ups: earn credit, notify, report, record discount.
    /// Failures here are logged and never fail the webhook.
    async fn run_follow_ups(&self, order: &Order, session: &CheckoutSession) {
        if let Some(user_id) = order.user_id {
            if order.total > Decimal::ZERO {
                match self
                    .ledger
                    .earn(Some(user_id), order.order_id, order.total, None)
                    .await
                {
                    Ok(outcome) if outcome.already_awarded => {
                        info!(order_id = %order.order_id, "Credit already earned for order");
                    }
                    Ok(outcome) => {
                        info!(
                            order_id = %order.order_id,
                            awarded = %outcome.awarded,
                            limit_reached = outcome.limit_reached,
                            "Purchase credit awarded"
                        );
                    }
                    Err(e) => {
                        warn!(order_id = %order.order_id, error = %e, "Credit earn failed, continuing");
                    }
                }
            }
        }

        SideEffects::best_effort(
            "order_confirmation",
            self.side_effects.notifications.send_order_confirmation(order),
        )
        .await;
        SideEffects::best_effort(
            "purchase_analytics",
            self.side_effects.analytics.record_purchase(order),
        )
        .await;
        if let Some(code) = &session.discount_code {
            SideEffects::best_effort(
                "discount_redemption",
                self.side_effects.discounts.record_redemption(
                    order.order_id,
                    code,
                    session.discount_amount,
                ),
            )
            .await;
        }
    }

    /// Payment failed: restore any held credit, then mark the order failed.
    ///
    /// The order is marked failed even when the reversal fails, but the
    /// error is propagated so the provider redelivers and the reversal gets
    /// retried. A reversal failure is flagged for manual review.
    async fn handle_payment_failed(
        &self,
        payment_intent_id: &str,
    ) -> Result<ReconcileOutcome, AppError> {
        let order = match self.orders.find_by_intent(payment_intent_id).await? {
            Some(o) => o,
            None => {
                info!(payment_intent_id = %payment_intent_id, "Payment failure for unknown intent");
                return Ok(ReconcileOutcome::NoMatch);
            }
        };

        if order.has_credit_hold() {
            if let Err(e) = self.restore_credit(&order).await {
                error!(
                    order_id = %order.order_id,
                    credits_applied = %order.credits_applied,
                    error = %e,
                    critical = true,
                    "Credit reversal failed after payment failure, manual review required"
                );
                REVERSAL_FAILURES.inc();
                self.orders.mark_payment_failed(order.order_id).await?;
                return Err(e);
            }
            self.orders.clear_credit_hold(order.order_id).await?;
        }

        self.orders.mark_payment_failed(order.order_id).await?;
        info!(order_id = %order.order_id, "Order marked payment-failed");
        Ok(ReconcileOutcome::Processed {
            order_id: order.order_id,
        })
    }

    async fn restore_credit(&self, order: &Order) -> Result<(), AppError> {
        let tx_id = match order.credit_transaction_id {
            // No transaction linkage to reverse; credit the balance directly.
            None => return self.credit_directly(order).await,
            Some(id) => id,
        };
        match self.ledger.reverse(tx_id, "Payment failed").await {
            Ok(outcome) => {
                info!(
                    order_id = %order.order_id,
                    restored = %outcome.restored,
                    released_hold = outcome.released_hold,
                    "Credit restored after payment failure"
                );
                Ok(())
            }
            // Transaction row gone: fall back to crediting the balance
            // directly so the user is made whole.
            Err(AppError::NotFound(_)) => self.credit_directly(order).await,
            Err(e) => Err(e),
        }
    }

    async fn credit_directly(&self, order: &Order) -> Result<(), AppError> {
        match order.user_id {
            Some(user_id) => {
                self.ledger
                    .adjust(
                        user_id,
                        order.credits_applied,
                        format!("Restored after failed payment on order {}", order.order_id),
                    )
                    .await?;
                Ok(())
            }
            None => Err(AppError::InternalError(anyhow::anyhow!(
                "Held transaction missing and no user to credit on order {}",
                order.order_id
            ))),
        }
    }

    /// Refund: record the status change only. Credits already spent on the
    /// order stay spent; any compensation is a manual decision.
    async fn handle_refund(&self, payment_intent_id: &str) -> Result<ReconcileOutcome, AppError> {
        let order = match self.orders.find_by_intent(payment_intent_id).await? {
            Some(o) => o,
            None => {
                info!(payment_intent_id = %payment_intent_id, "Refund for unknown intent");
                return Ok(ReconcileOutcome::NoMatch);
            }
        };

        self.orders.mark_refunded(order.order_id).await?;
        info!(order_id = %order.order_id, "Order marked refunded");
        Ok(ReconcileOutcome::Processed {
            order_id: order.order_id,
        })
    }
}

/// Decide the post-payment fulfillment route. Reorders and orders whose
/// items all skip proofing go straight to printing with the proof recorded
/// as approved; anything else waits in proof building.
fn route_for_proofing(order: &Order, session: &CheckoutSession) -> (OrderStatus, Option<String>) {
    let all_no_proof = !session.line_items.is_empty()
        && session
            .line_items
            .iter()
            .all(|li| li.proof_preference == ProofPreference::NoProof);

    if order.is_reorder || all_no_proof {
        (OrderStatus::Printing, Some(PROOF_APPROVED.to_string()))
    } else {
        (OrderStatus::BuildingProof, None)
    }
}
