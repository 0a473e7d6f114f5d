#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use credit_service::models::{
    CreditTransaction, NewCreditTransaction, Order, TransactionType,
};
use credit_service::services::ledger::CreditLedger;
use credit_service::services::reconciler::{
    CheckoutProvider, CheckoutSession, ProofPreference, SessionLineItem, WebhookReconciler,
};
use credit_service::services::side_effects::SideEffects;
use credit_service::stores::memory::{MemoryLedgerStore, MemoryOrderStore};
use credit_service::stores::{LedgerStore, Reversal};

pub fn ledger() -> (CreditLedger, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    (CreditLedger::new(store.clone()), store)
}

/// Seed a user's balance with a positive adjustment.
pub async fn grant(ledger: &CreditLedger, user_id: Uuid, amount: Decimal) -> CreditTransaction {
    ledger
        .adjust(user_id, amount, "Test grant".to_string())
        .await
        .unwrap()
}

pub fn dollars(whole: i64) -> Decimal {
    Decimal::new(whole, 0)
}

pub fn cents(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

pub fn awaiting_order(user_id: Option<Uuid>, total: Decimal) -> Order {
    Order {
        order_id: Uuid::new_v4(),
        user_id,
        guest_email: None,
        payment_session_id: None,
        payment_intent_id: None,
        order_status: "awaiting_payment".to_string(),
        financial_status: "pending".to_string(),
        proof_status: None,
        is_reorder: false,
        credits_applied: Decimal::ZERO,
        credit_transaction_id: None,
        subtotal: total,
        tax: Decimal::ZERO,
        total,
        customer_email: None,
        shipping: None,
        created_utc: Utc::now(),
    }
}

pub fn line_item(preference: ProofPreference) -> SessionLineItem {
    SessionLineItem {
        description: "Business cards".to_string(),
        quantity: 1,
        proof_preference: preference,
    }
}

pub fn paid_session(session_id: &str, user_id: Option<Uuid>, total: Decimal) -> CheckoutSession {
    CheckoutSession {
        session_id: session_id.to_string(),
        payment_intent_id: Some(format!("pi_{}", session_id)),
        payment_status: "paid".to_string(),
        user_id,
        customer_email: Some("buyer@example.com".to_string()),
        amount_subtotal: total,
        amount_tax: Decimal::ZERO,
        amount_total: total,
        line_items: vec![line_item(ProofPreference::Proof)],
        shipping: Some(json!({ "name": "Buyer", "address": { "line1": "1 Main St" } })),
        discount_code: None,
        discount_amount: Decimal::ZERO,
    }
}

/// Provider double returning queued sessions per id. The last queued
/// response for an id is repeated on further calls.
#[derive(Default)]
pub struct StubProvider {
    responses: Mutex<HashMap<String, VecDeque<CheckoutSession>>>,
    pub calls: AtomicU32,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, session: CheckoutSession) {
        self.responses
            .lock()
            .unwrap()
            .entry(session.session_id.clone())
            .or_default()
            .push_back(session);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckoutProvider for StubProvider {
    async fn fetch_session(&self, session_id: &str) -> Result<CheckoutSession, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let queue = responses.get_mut(session_id).ok_or_else(|| {
            AppError::BadGateway(format!("No such session: {}", session_id))
        })?;
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| AppError::BadGateway(format!("No such session: {}", session_id)))
        }
    }
}

pub struct ReconcilerFixture {
    pub reconciler: WebhookReconciler,
    pub orders: Arc<MemoryOrderStore>,
    pub ledger_store: Arc<MemoryLedgerStore>,
    pub ledger: CreditLedger,
    pub provider: Arc<StubProvider>,
}

pub fn reconciler() -> ReconcilerFixture {
    let orders = Arc::new(MemoryOrderStore::new());
    let ledger_store = Arc::new(MemoryLedgerStore::new());
    let ledger = CreditLedger::new(ledger_store.clone());
    let provider = Arc::new(StubProvider::new());
    let reconciler = WebhookReconciler::new(
        orders.clone(),
        ledger.clone(),
        provider.clone(),
        SideEffects::logging(),
    )
    .with_refetch_delay(Duration::ZERO);
    ReconcilerFixture {
        reconciler,
        orders,
        ledger_store,
        ledger,
        provider,
    }
}

/// Ledger store that fails every call, for exercising degraded reads.
pub struct FailingLedgerStore;

fn down<T>() -> Result<T, AppError> {
    Err(AppError::DatabaseError(anyhow::anyhow!("store down")))
}

#[async_trait]
impl LedgerStore for FailingLedgerStore {
    async fn insert(&self, _tx: NewCreditTransaction) -> Result<CreditTransaction, AppError> {
        down()
    }
    async fn get(&self, _id: Uuid) -> Result<Option<CreditTransaction>, AppError> {
        down()
    }
    async fn list_for_user(&self, _user_id: Uuid) -> Result<Vec<CreditTransaction>, AppError> {
        down()
    }
    async fn find_earned(
        &self,
        _user_id: Uuid,
        _order_id: Uuid,
    ) -> Result<Option<CreditTransaction>, AppError> {
        down()
    }
    async fn find_deduction(
        &self,
        _user_id: Uuid,
        _order_id: Uuid,
        _transaction_type: TransactionType,
    ) -> Result<Option<CreditTransaction>, AppError> {
        down()
    }
    async fn confirm_reservation(
        &self,
        _id: Uuid,
        _order_id: Uuid,
        _new_balance: Decimal,
    ) -> Result<Option<CreditTransaction>, AppError> {
        down()
    }
    async fn delete(&self, _id: Uuid) -> Result<bool, AppError> {
        down()
    }
    async fn reverse(&self, _id: Uuid, _reason: &str) -> Result<Option<Reversal>, AppError> {
        down()
    }
    async fn delete_reservations_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        down()
    }
}
