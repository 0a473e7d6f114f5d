//! Order model: the subset of order state the credit subsystem reads and writes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Proof status recorded when the proofing step is skipped.
pub const PROOF_APPROVED: &str = "approved";

/// Order fulfillment states. Only the transition out of `AwaitingPayment`
/// is driven by this service; later states belong to the production workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingPayment,
    BuildingProof,
    Printing,
    Shipped,
    Delivered,
    PaymentFailed,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingPayment => "awaiting_payment",
            Self::BuildingProof => "building_proof",
            Self::Printing => "printing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::PaymentFailed => "payment_failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "awaiting_payment" => Self::AwaitingPayment,
            "building_proof" => Self::BuildingProof,
            "printing" => Self::Printing,
            "shipped" => Self::Shipped,
            "delivered" => Self::Delivered,
            "payment_failed" => Self::PaymentFailed,
            "refunded" => Self::Refunded,
            _ => Self::AwaitingPayment,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment-side status, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl FinancialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for FinancialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An order as seen by the credit subsystem.
///
/// `user_id` is `None` for guest checkouts. An order optionally owns one
/// credit transaction (the reservation or deduction applied to it) via
/// `credit_transaction_id`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub guest_email: Option<String>,
    pub payment_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub order_status: String,
    pub financial_status: String,
    pub proof_status: Option<String>,
    pub is_reorder: bool,
    pub credits_applied: Decimal,
    pub credit_transaction_id: Option<Uuid>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub customer_email: Option<String>,
    pub shipping: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl Order {
    /// Get parsed order status.
    pub fn parsed_status(&self) -> OrderStatus {
        OrderStatus::from_str(&self.order_status)
    }

    /// Get parsed financial status.
    pub fn parsed_financial_status(&self) -> FinancialStatus {
        FinancialStatus::from_str(&self.financial_status)
    }

    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }

    /// Whether credit is held against this order. The transaction linkage
    /// may be missing even when credit was applied; restoration falls back
    /// to a direct adjustment in that case.
    pub fn has_credit_hold(&self) -> bool {
        self.credits_applied > Decimal::ZERO
    }
}

/// Fields applied to an order in one step when its payment is confirmed.
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub payment_session_id: String,
    pub payment_intent_id: Option<String>,
    pub order_status: OrderStatus,
    pub financial_status: FinancialStatus,
    pub proof_status: Option<String>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub customer_email: Option<String>,
    pub shipping: Option<serde_json::Value>,
}
