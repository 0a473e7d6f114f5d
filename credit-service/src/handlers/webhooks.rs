//! Payment provider webhook handler.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::json;
use service_core::error::AppError;
use tracing::{info, instrument};

use crate::services::reconciler::ReconcileOutcome;
use crate::services::stripe::{StripeClient, WebhookEvent};
use crate::AppState;

/// Receive a Stripe webhook.
///
/// The signature is verified against the raw body before anything is parsed
/// or mutated. Recognized events are reconciled; a reconciliation error
/// returns 500 so the provider redelivers. Unrecognized events are
/// acknowledged with 200 so the provider stops retrying them.
#[instrument(skip(state, headers, body))]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing stripe-signature header"))
        })?;

    state.stripe.verify_webhook_signature(&body, signature)?;

    let event: WebhookEvent = serde_json::from_str(&body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Malformed webhook payload: {}", e)))?;

    info!(event_id = %event.id, event_type = %event.event_type, "Webhook received");

    let classified = StripeClient::classify_event(&event);
    let outcome = state.reconciler.handle(classified).await?;

    let outcome_label = match outcome {
        ReconcileOutcome::Processed { .. } => "processed",
        ReconcileOutcome::Recovered { .. } => "recovered",
        ReconcileOutcome::NoMatch => "no_match",
        ReconcileOutcome::Ignored => "ignored",
    };

    Ok((
        StatusCode::OK,
        Json(json!({ "received": true, "outcome": outcome_label })),
    ))
}
