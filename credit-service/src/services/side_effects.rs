//! Post-payment side effects: notification, analytics, discount recording.
//!
//! None of these may fail the webhook flow. Callers route them through
//! [`SideEffects::best_effort`], which logs failures and continues.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::Order;

/// Order confirmation delivery.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), AppError>;
}

/// Purchase analytics reporting.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_purchase(&self, order: &Order) -> Result<(), AppError>;
}

/// Discount code redemption recording.
#[async_trait]
pub trait DiscountRecorder: Send + Sync {
    async fn record_redemption(
        &self,
        order_id: Uuid,
        code: &str,
        amount: Decimal,
    ) -> Result<(), AppError>;
}

/// Default sender that only logs. Stands in until a mail provider is wired up.
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), AppError> {
        info!(
            order_id = %order.order_id,
            email = order.customer_email.as_deref().unwrap_or("unknown"),
            "Order confirmation queued"
        );
        Ok(())
    }
}

pub struct LogAnalyticsSink;

#[async_trait]
impl AnalyticsSink for LogAnalyticsSink {
    async fn record_purchase(&self, order: &Order) -> Result<(), AppError> {
        info!(order_id = %order.order_id, total = %order.total, "Purchase recorded");
        Ok(())
    }
}

pub struct LogDiscountRecorder;

#[async_trait]
impl DiscountRecorder for LogDiscountRecorder {
    async fn record_redemption(
        &self,
        order_id: Uuid,
        code: &str,
        amount: Decimal,
    ) -> Result<(), AppError> {
        info!(order_id = %order_id, code = code, amount = %amount, "Discount redemption recorded");
        Ok(())
    }
}

/// Bundle of side-effect handlers injected into the reconciler.
#[derive(Clone)]
pub struct SideEffects {
    pub notifications: Arc<dyn NotificationSender>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub discounts: Arc<dyn DiscountRecorder>,
}

impl SideEffects {
    /// Logging-only handlers.
    pub fn logging() -> Self {
        Self {
            notifications: Arc::new(LogNotificationSender),
            analytics: Arc::new(LogAnalyticsSink),
            discounts: Arc::new(LogDiscountRecorder),
        }
    }

    /// Run a side effect, logging and swallowing any error.
    pub async fn best_effort<F>(name: &str, fut: F)
    where
        F: Future<Output = Result<(), AppError>>,
    {
        if let Err(e) = fut.await {
            warn!(side_effect = name, error = %e, "Side effect failed, continuing");
        }
    }
}
