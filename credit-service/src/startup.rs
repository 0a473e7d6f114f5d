//! Application startup and lifecycle management.

use crate::config::Config;
use crate::handlers::{credits, webhooks};
use crate::services::ledger::CreditLedger;
use crate::services::metrics::{get_metrics, init_metrics};
use crate::services::reconciler::WebhookReconciler;
use crate::services::side_effects::SideEffects;
use crate::services::stripe::StripeClient;
use crate::stores::postgres::{Database, PgLedgerStore, PgOrderStore};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub ledger: CreditLedger,
    pub reconciler: Arc<WebhookReconciler>,
    pub stripe: StripeClient,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "credit-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "credit-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let db = Arc::new(db);
        let ledger_store = Arc::new(PgLedgerStore::new(db.pool().clone()));
        let order_store = Arc::new(PgOrderStore::new(db.pool().clone()));

        let ledger = CreditLedger::new(ledger_store);
        let stripe = StripeClient::new(config.stripe.clone());
        let reconciler = Arc::new(WebhookReconciler::new(
            order_store,
            ledger.clone(),
            Arc::new(stripe.clone()),
            SideEffects::logging(),
        ));

        let state = AppState {
            config: config.clone(),
            db,
            ledger,
            reconciler,
            stripe,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Credit service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .route("/credits/:user_id/balance", get(credits::get_balance))
            .route("/credits/validate", post(credits::validate))
            .route("/credits/reserve", post(credits::reserve))
            .route("/credits/deduct", post(credits::deduct))
            .route("/credits/earn", post(credits::earn))
            .route(
                "/credits/reservations/:transaction_id/confirm",
                post(credits::confirm_reservation),
            )
            .route(
                "/credits/reservations/:transaction_id",
                delete(credits::cancel_reservation),
            )
            .route(
                "/credits/transactions/:transaction_id/reverse",
                post(credits::reverse),
            )
            .route("/webhooks/stripe", post(webhooks::stripe_webhook))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        tracing::info!(port = self.port, "Credit service starting");
        axum::serve(self.listener, router).await
    }
}
