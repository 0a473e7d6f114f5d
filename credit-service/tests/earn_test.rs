mod common;

use common::{cents, dollars, grant, ledger};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

#[tokio::test]
async fn earn_awards_five_percent_of_total() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();

    let outcome = ledger.earn(Some(user), order, dollars(50), None).await.unwrap();

    assert_eq!(outcome.awarded, cents(250));
    assert!(!outcome.limit_reached);
    assert!(!outcome.already_awarded);
    assert_eq!(ledger.balance(user).await.balance, cents(250));
}

#[tokio::test]
async fn earn_truncates_at_the_cap() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(96)).await;

    // 5% of $100 is $5, but only $4 fits under the $100 cap.
    let outcome = ledger
        .earn(Some(user), Uuid::new_v4(), dollars(100), None)
        .await
        .unwrap();

    assert_eq!(outcome.awarded, dollars(4));
    assert!(outcome.limit_reached);
    assert_eq!(ledger.balance(user).await.balance, dollars(100));
}

#[tokio::test]
async fn earn_at_the_cap_awards_nothing() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(100)).await;

    let outcome = ledger
        .earn(Some(user), Uuid::new_v4(), dollars(40), None)
        .await
        .unwrap();

    assert_eq!(outcome.awarded, Decimal::ZERO);
    assert!(outcome.limit_reached);
    assert!(outcome.transaction.is_none());
    assert_eq!(store.all().len(), 1);
    assert_eq!(ledger.balance(user).await.balance, dollars(100));
}

#[tokio::test]
async fn repeated_earn_for_same_order_awards_once() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();

    let first = ledger.earn(Some(user), order, dollars(50), None).await.unwrap();
    let second = ledger.earn(Some(user), order, dollars(50), None).await.unwrap();

    assert!(!first.already_awarded);
    assert!(second.already_awarded);
    assert_eq!(second.awarded, first.awarded);
    assert_eq!(ledger.balance(user).await.balance, cents(250));
    assert_eq!(store.all().len(), 1);
}

#[tokio::test]
async fn concurrent_earns_for_same_order_award_once() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();

    let a = {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.earn(Some(user), order, dollars(50), None).await })
    };
    let b = {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.earn(Some(user), order, dollars(50), None).await })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let earned: Vec<_> = store
        .all()
        .into_iter()
        .filter(|t| t.transaction_type == "earned")
        .collect();
    assert_eq!(earned.len(), 1);
    assert_eq!(ledger.balance(user).await.balance, cents(250));
}

#[tokio::test]
async fn earn_rounds_to_cents() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();

    let outcome = ledger
        .earn(Some(user), Uuid::new_v4(), cents(1033), None)
        .await
        .unwrap();

    assert_eq!(outcome.awarded, cents(52));
}

#[tokio::test]
async fn guest_orders_earn_nothing() {
    let (ledger, store) = ledger();

    let outcome = ledger
        .earn(None, Uuid::new_v4(), dollars(50), None)
        .await
        .unwrap();

    assert_eq!(outcome.awarded, Decimal::ZERO);
    assert!(outcome.transaction.is_none());
    assert!(outcome.message.is_some());
    assert!(store.all().is_empty());
}

#[tokio::test]
async fn earn_rejects_nonpositive_total() {
    let (ledger, _) = ledger();
    let err = ledger
        .earn(Some(Uuid::new_v4()), Uuid::new_v4(), Decimal::ZERO, None)
        .await;
    assert!(matches!(err, Err(AppError::BadRequest(_))));
}
