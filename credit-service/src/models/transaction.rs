//! Credit transaction model: the unit of the store-credit ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Transaction types recognized by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Earned,
    Used,
    ReservationPendingPayment,
    Adjustment,
}

impl TransactionType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earned => "earned",
            Self::Used => "used",
            Self::ReservationPendingPayment => "reservation_pending_payment",
            Self::Adjustment => "adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "earned" => Some(Self::Earned),
            "used" => Some(Self::Used),
            "reservation_pending_payment" => Some(Self::ReservationPendingPayment),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single ledger row.
///
/// `amount` is signed: positive rows increase the user's balance, negative
/// rows decrease it (spends and holds). The `balance` column is an advisory
/// snapshot written at insert time for audit; the authoritative balance is
/// always the running sum of a user's amounts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: String,
    pub order_id: Option<Uuid>,
    pub reason: String,
    pub balance: Decimal,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

impl CreditTransaction {
    /// Get parsed transaction type.
    pub fn parsed_type(&self) -> Option<TransactionType> {
        TransactionType::from_str(&self.transaction_type)
    }

    /// Whether this row is a pending reservation (a hold, not a realized spend).
    pub fn is_reservation(&self) -> bool {
        self.transaction_type == TransactionType::ReservationPendingPayment.as_str()
    }
}

/// Input for inserting a ledger row.
#[derive(Debug, Clone)]
pub struct NewCreditTransaction {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub order_id: Option<Uuid>,
    pub reason: String,
    pub balance: Decimal,
    pub expires_utc: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}
