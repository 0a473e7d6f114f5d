//! Stripe checkout provider client.
//!
//! Implements session retrieval for reconciliation and webhook signature
//! verification (`Stripe-Signature: t=...,v1=...` over `"{t}.{body}"`).

use crate::config::StripeConfig;
use crate::services::reconciler::{
    CheckoutProvider, CheckoutSession, PaymentEvent, ProofPreference, SessionLineItem,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use service_core::utils::signature::verify_payload;
use uuid::Uuid;

/// Reject webhook timestamps older than this (replay protection).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A raw webhook event envelope.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiSession {
    id: String,
    payment_intent: Option<String>,
    payment_status: String,
    customer_email: Option<String>,
    customer_details: Option<ApiCustomerDetails>,
    amount_subtotal: Option<i64>,
    amount_total: Option<i64>,
    total_details: Option<ApiTotalDetails>,
    metadata: Option<serde_json::Value>,
    line_items: Option<ApiList<ApiLineItem>>,
    shipping_details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiCustomerDetails {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTotalDetails {
    amount_tax: Option<i64>,
    amount_discount: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiLineItem {
    description: Option<String>,
    quantity: Option<u32>,
    price: Option<ApiPrice>,
}

#[derive(Debug, Deserialize)]
struct ApiPrice {
    metadata: Option<serde_json::Value>,
}

/// Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if Stripe credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
            && !self.config.webhook_secret.expose_secret().is_empty()
    }

    /// Verify a webhook signature header against the raw request body.
    pub fn verify_webhook_signature(&self, payload: &str, header: &str) -> Result<(), AppError> {
        verify_signature_at(
            self.config.webhook_secret.expose_secret(),
            payload,
            header,
            Utc::now().timestamp(),
        )
    }

    /// Classify a webhook event into the reconciler's vocabulary.
    pub fn classify_event(event: &WebhookEvent) -> PaymentEvent {
        let object = &event.data.object;
        match event.event_type.as_str() {
            "checkout.session.completed" => match object["id"].as_str() {
                Some(id) => PaymentEvent::CheckoutCompleted {
                    session_id: id.to_string(),
                },
                None => PaymentEvent::Ignored {
                    event_type: event.event_type.clone(),
                },
            },
            "payment_intent.succeeded" => match object["id"].as_str() {
                Some(id) => PaymentEvent::PaymentSucceeded {
                    payment_intent_id: id.to_string(),
                },
                None => PaymentEvent::Ignored {
                    event_type: event.event_type.clone(),
                },
            },
            "payment_intent.payment_failed" => match object["id"].as_str() {
                Some(id) => PaymentEvent::PaymentFailed {
                    payment_intent_id: id.to_string(),
                },
                None => PaymentEvent::Ignored {
                    event_type: event.event_type.clone(),
                },
            },
            // The refund object references its intent, not the session.
            "charge.refunded" => match object["payment_intent"].as_str() {
                Some(id) => PaymentEvent::ChargeRefunded {
                    payment_intent_id: id.to_string(),
                },
                None => PaymentEvent::Ignored {
                    event_type: event.event_type.clone(),
                },
            },
            _ => PaymentEvent::Ignored {
                event_type: event.event_type.clone(),
            },
        }
    }
}

#[async_trait]
impl CheckoutProvider for StripeClient {
    async fn fetch_session(&self, session_id: &str) -> Result<CheckoutSession, AppError> {
        if !self.is_configured() {
            tracing::error!("Stripe credentials not configured");
            return Err(AppError::ServiceUnavailable);
        }

        let url = format!(
            "{}/checkout/sessions/{}?expand[]=line_items",
            self.config.api_base_url, session_id
        );

        let response = self
            .client
            .get(&url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("Stripe request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::BadGateway(format!("Stripe response read failed: {}", e)))?;

        tracing::debug!(status = %status, session_id = %session_id, "Stripe session response");

        if !status.is_success() {
            return Err(AppError::BadGateway(format!(
                "Stripe session fetch returned {}: {}",
                status, body
            )));
        }

        let api: ApiSession = serde_json::from_str(&body).map_err(|e| {
            AppError::BadGateway(format!("Stripe session parse failed: {}", e))
        })?;

        Ok(map_session(api))
    }
}

fn map_session(api: ApiSession) -> CheckoutSession {
    let user_id = api
        .metadata
        .as_ref()
        .and_then(|m| m["user_id"].as_str())
        .and_then(|s| Uuid::parse_str(s).ok());

    let customer_email = api
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone())
        .or(api.customer_email);

    let line_items = api
        .line_items
        .map(|list| list.data.into_iter().map(map_line_item).collect())
        .unwrap_or_default();

    let amount_tax = api
        .total_details
        .as_ref()
        .and_then(|t| t.amount_tax)
        .unwrap_or(0);
    let discount_amount = api
        .total_details
        .as_ref()
        .and_then(|t| t.amount_discount)
        .unwrap_or(0);

    let discount_code = api
        .metadata
        .as_ref()
        .and_then(|m| m["discount_code"].as_str())
        .map(String::from);

    CheckoutSession {
        session_id: api.id,
        payment_intent_id: api.payment_intent,
        payment_status: api.payment_status,
        user_id,
        customer_email,
        amount_subtotal: cents(api.amount_subtotal.unwrap_or(0)),
        amount_tax: cents(amount_tax),
        amount_total: cents(api.amount_total.unwrap_or(0)),
        line_items,
        shipping: api.shipping_details,
        discount_code,
        discount_amount: cents(discount_amount),
    }
}

fn map_line_item(item: ApiLineItem) -> SessionLineItem {
    let proof_preference = item
        .price
        .as_ref()
        .and_then(|p| p.metadata.as_ref())
        .and_then(|m| m["proof_preference"].as_str())
        .map(|s| match s {
            "no_proof" => ProofPreference::NoProof,
            _ => ProofPreference::Proof,
        })
        .unwrap_or(ProofPreference::Proof);

    SessionLineItem {
        description: item.description.unwrap_or_default(),
        quantity: item.quantity.unwrap_or(1),
        proof_preference,
    }
}

/// Amounts on the wire are integer cents.
fn cents(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

fn verify_signature_at(
    secret: &str,
    payload: &str,
    header: &str,
    now: i64,
) -> Result<(), AppError> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<&str> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signature = Some(v),
            _ => {}
        }
    }

    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Malformed webhook signature header"
            )))
        }
    };

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Webhook timestamp outside tolerance"
        )));
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let valid = verify_payload(secret, &signed_payload, signature)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature check failed: {}", e)))?;

    if !valid {
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    Ok(())
}
