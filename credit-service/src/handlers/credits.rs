//! Credit ledger handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{CreditTransaction, TransactionType};
use crate::services::ledger::{
    BalanceSummary, ConfirmOutcome, CreditValidation, DeductOutcome, EarnOutcome, ReversalOutcome,
};
use crate::AppState;

/// Get a user's balance and transaction history.
///
/// Degrades rather than fails: a store outage returns a zeroed summary with
/// `available: false`.
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Json<BalanceSummary> {
    Json(state.ledger.balance(user_id).await)
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    /// Absent for guest checkouts, which are never eligible.
    pub user_id: Option<Uuid>,
    pub order_subtotal: Decimal,
    pub requested_amount: Decimal,
}

/// Check whether a requested credit spend is covered by the user's balance
/// and the order subtotal. Ineligible requests come back `valid: false` with
/// a message, not an error.
pub async fn validate(
    State(state): State<AppState>,
    Json(payload): Json<ValidateRequest>,
) -> Result<Json<CreditValidation>, AppError> {
    let validation = state
        .ledger
        .validate(
            payload.user_id,
            payload.order_subtotal,
            payload.requested_amount,
        )
        .await?;
    Ok(Json(validation))
}

fn default_reserve_reason() -> String {
    "Reserved for checkout".to_string()
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReserveRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    #[serde(default = "default_reserve_reason")]
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[validate(length(min = 1, max = 255))]
    pub session_id: String,
}

/// Place a hold against the user's balance for a checkout session.
pub async fn reserve(
    State(state): State<AppState>,
    Json(payload): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<CreditTransaction>), AppError> {
    payload.validate()?;
    let reservation = state
        .ledger
        .reserve(
            payload.user_id,
            payload.amount,
            &payload.reason,
            &payload.session_id,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub order_id: Uuid,
}

/// Realize a pending reservation as a spend on an order.
pub async fn confirm_reservation(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<Json<ConfirmOutcome>, AppError> {
    let outcome = state
        .ledger
        .confirm_reservation(transaction_id, payload.order_id)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Release a pending reservation. Cancelling an absent one succeeds.
pub async fn cancel_reservation(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Query(params): Query<CancelParams>,
) -> Result<Json<CancelResponse>, AppError> {
    let reason = params.reason.as_deref().unwrap_or("Cancelled by caller");
    let cancelled = state
        .ledger
        .cancel_reservation(transaction_id, reason)
        .await?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct DeductRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[serde(default = "default_deduct_type")]
    pub transaction_type: TransactionType,
    pub created_by: Option<String>,
}

fn default_deduct_type() -> TransactionType {
    TransactionType::Used
}

/// Record a direct spend against an order.
pub async fn deduct(
    State(state): State<AppState>,
    Json(payload): Json<DeductRequest>,
) -> Result<Json<DeductOutcome>, AppError> {
    payload.validate()?;
    let outcome = state
        .ledger
        .deduct(
            payload.user_id,
            payload.amount,
            payload.order_id,
            payload.reason,
            payload.transaction_type,
            payload.created_by,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct EarnRequest {
    /// Absent for guest orders, which earn nothing.
    pub user_id: Option<Uuid>,
    pub order_id: Uuid,
    pub order_total: Decimal,
    pub created_by: Option<String>,
}

/// Award purchase credit for an order.
pub async fn earn(
    State(state): State<AppState>,
    Json(payload): Json<EarnRequest>,
) -> Result<Json<EarnOutcome>, AppError> {
    let outcome = state
        .ledger
        .earn(
            payload.user_id,
            payload.order_id,
            payload.order_total,
            payload.created_by,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReverseRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

/// Undo a transaction with a compensating entry (or release a hold).
pub async fn reverse(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(payload): Json<ReverseRequest>,
) -> Result<Json<ReversalOutcome>, AppError> {
    payload.validate()?;
    let outcome = state
        .ledger
        .reverse(transaction_id, &payload.reason)
        .await?;
    Ok(Json(outcome))
}
