mod common;

use chrono::{Duration, Utc};
use common::{awaiting_order, dollars, grant, ledger, FailingLedgerStore};
use rust_decimal::Decimal;
use service_core::retry::RetryConfig;
use std::sync::Arc;
use uuid::Uuid;

use credit_service::services::cleanup::CleanupService;
use credit_service::services::ledger::CreditLedger;
use credit_service::stores::memory::MemoryOrderStore;
use credit_service::stores::OrderStore;

#[tokio::test]
async fn abandoned_checkout_restores_held_credit() {
    let (credit_ledger, _) = ledger();
    let orders = Arc::new(MemoryOrderStore::new());
    let user = Uuid::new_v4();

    grant(&credit_ledger, user, dollars(20)).await;
    let hold = credit_ledger.reserve(user, dollars(10), "Checkout hold", "cs_stale").await.unwrap();

    let mut order = awaiting_order(Some(user), dollars(40));
    order.payment_session_id = Some("cs_stale".to_string());
    order.credits_applied = dollars(10);
    order.credit_transaction_id = Some(hold.transaction_id);
    order.created_utc = Utc::now() - Duration::hours(48);
    let order = orders.insert(order).await.unwrap();

    let cleanup = CleanupService::new(orders.clone(), credit_ledger.clone());
    let report = cleanup.cleanup_abandoned_checkouts(24).await.unwrap();

    assert_eq!(report.sessions_processed, 1);
    assert_eq!(report.orders_touched, 1);
    assert_eq!(report.credits_restored, dollars(10));
    assert_eq!(report.failures, 0);

    assert_eq!(credit_ledger.balance(user).await.balance, dollars(20));
    let order = orders.get(order.order_id).await.unwrap().unwrap();
    assert_eq!(order.credits_applied, Decimal::ZERO);
    assert!(order.credit_transaction_id.is_none());
}

#[tokio::test]
async fn second_sweep_is_a_noop() {
    let (credit_ledger, _) = ledger();
    let orders = Arc::new(MemoryOrderStore::new());
    let user = Uuid::new_v4();

    grant(&credit_ledger, user, dollars(20)).await;
    let hold = credit_ledger.reserve(user, dollars(10), "Checkout hold", "cs_stale").await.unwrap();

    let mut order = awaiting_order(Some(user), dollars(40));
    order.payment_session_id = Some("cs_stale".to_string());
    order.credits_applied = dollars(10);
    order.credit_transaction_id = Some(hold.transaction_id);
    order.created_utc = Utc::now() - Duration::hours(48);
    orders.insert(order).await.unwrap();

    let cleanup = CleanupService::new(orders.clone(), credit_ledger.clone());
    cleanup.cleanup_abandoned_checkouts(24).await.unwrap();
    let second = cleanup.cleanup_abandoned_checkouts(24).await.unwrap();

    assert_eq!(second.sessions_processed, 0);
    assert_eq!(second.credits_restored, Decimal::ZERO);
    assert_eq!(credit_ledger.balance(user).await.balance, dollars(20));
}

#[tokio::test]
async fn recent_checkouts_are_left_alone() {
    let (credit_ledger, _) = ledger();
    let orders = Arc::new(MemoryOrderStore::new());
    let user = Uuid::new_v4();

    grant(&credit_ledger, user, dollars(20)).await;
    let hold = credit_ledger.reserve(user, dollars(10), "Checkout hold", "cs_fresh").await.unwrap();

    let mut order = awaiting_order(Some(user), dollars(40));
    order.payment_session_id = Some("cs_fresh".to_string());
    order.credits_applied = dollars(10);
    order.credit_transaction_id = Some(hold.transaction_id);
    let order = orders.insert(order).await.unwrap();

    let cleanup = CleanupService::new(orders.clone(), credit_ledger.clone());
    let report = cleanup.cleanup_abandoned_checkouts(24).await.unwrap();

    assert_eq!(report.sessions_processed, 0);
    let order = orders.get(order.order_id).await.unwrap().unwrap();
    assert_eq!(order.credits_applied, dollars(10));
    assert_eq!(credit_ledger.balance(user).await.balance, dollars(10));
}

#[tokio::test]
async fn session_failure_is_counted_and_does_not_abort() {
    let failing_ledger =
        CreditLedger::new(Arc::new(FailingLedgerStore)).with_retry(RetryConfig::no_retry());
    let orders = Arc::new(MemoryOrderStore::new());

    let mut order = awaiting_order(Some(Uuid::new_v4()), dollars(40));
    order.payment_session_id = Some("cs_broken".to_string());
    order.credits_applied = dollars(10);
    order.credit_transaction_id = Some(Uuid::new_v4());
    order.created_utc = Utc::now() - Duration::hours(48);
    orders.insert(order).await.unwrap();

    let cleanup = CleanupService::new(orders, failing_ledger);
    let report = cleanup.cleanup_abandoned_checkouts(24).await.unwrap();

    assert_eq!(report.sessions_processed, 1);
    assert_eq!(report.failures, 1);
    assert!(report.had_failures());
}

#[tokio::test]
async fn expired_reservations_are_deleted() {
    let (credit_ledger, store) = ledger();
    let orders = Arc::new(MemoryOrderStore::new());
    let user = Uuid::new_v4();

    grant(&credit_ledger, user, dollars(30)).await;
    let stale = credit_ledger.reserve(user, dollars(5), "Checkout hold", "cs_old").await.unwrap();
    let fresh = credit_ledger.reserve(user, dollars(5), "Checkout hold", "cs_new").await.unwrap();
    store.backdate(stale.transaction_id, Utc::now() - Duration::hours(30));

    let cleanup = CleanupService::new(orders, credit_ledger.clone());
    let deleted = cleanup.cleanup_expired_reservations().await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(credit_ledger.balance(user).await.balance, dollars(25));
    let remaining = store.all();
    assert!(remaining.iter().any(|t| t.transaction_id == fresh.transaction_id));
    assert!(!remaining.iter().any(|t| t.transaction_id == stale.transaction_id));
}

#[tokio::test]
async fn confirmed_spends_survive_the_reservation_sweep() {
    let (credit_ledger, store) = ledger();
    let orders = Arc::new(MemoryOrderStore::new());
    let user = Uuid::new_v4();

    grant(&credit_ledger, user, dollars(30)).await;
    let hold = credit_ledger.reserve(user, dollars(5), "Checkout hold", "cs_paid").await.unwrap();
    credit_ledger
        .confirm_reservation(hold.transaction_id, Uuid::new_v4())
        .await
        .unwrap();
    store.backdate(hold.transaction_id, Utc::now() - Duration::hours(30));

    let cleanup = CleanupService::new(orders, credit_ledger.clone());
    let deleted = cleanup.cleanup_expired_reservations().await.unwrap();

    assert_eq!(deleted, 0);
    assert_eq!(credit_ledger.balance(user).await.balance, dollars(25));
}
