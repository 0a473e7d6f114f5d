mod common;

use common::{dollars, grant, ledger};
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::test]
async fn valid_request_within_balance_and_subtotal() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(25)).await;

    let validation = ledger
        .validate(Some(user), dollars(60), dollars(20))
        .await
        .unwrap();

    assert!(validation.valid);
    assert!(validation.message.is_none());
    assert_eq!(validation.balance, dollars(25));
    assert_eq!(validation.max_applicable, dollars(25));
}

#[tokio::test]
async fn guests_are_rejected() {
    let (ledger, _) = ledger();

    let validation = ledger
        .validate(None, dollars(60), dollars(20))
        .await
        .unwrap();

    assert!(!validation.valid);
    assert!(validation.message.is_some());
    assert_eq!(validation.max_applicable, Decimal::ZERO);
}

#[tokio::test]
async fn max_applicable_is_capped_by_subtotal() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(50)).await;

    let validation = ledger
        .validate(Some(user), dollars(30), dollars(10))
        .await
        .unwrap();

    assert!(validation.valid);
    assert_eq!(validation.max_applicable, dollars(30));
}

#[tokio::test]
async fn requested_above_balance_is_invalid() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(5)).await;

    let validation = ledger
        .validate(Some(user), dollars(60), dollars(10))
        .await
        .unwrap();

    assert!(!validation.valid);
    assert!(validation.message.is_some());
    assert_eq!(validation.max_applicable, dollars(5));
}

#[tokio::test]
async fn requested_above_subtotal_is_invalid() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(50)).await;

    let validation = ledger
        .validate(Some(user), dollars(20), dollars(30))
        .await
        .unwrap();

    assert!(!validation.valid);
    assert!(validation.message.is_some());
}

#[tokio::test]
async fn nonpositive_request_is_invalid() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(50)).await;

    let validation = ledger
        .validate(Some(user), dollars(20), Decimal::ZERO)
        .await
        .unwrap();

    assert!(!validation.valid);
    assert!(validation.message.is_some());
}
