mod common;

use common::{dollars, grant, ledger};
use credit_service::models::TransactionType;
use service_core::error::AppError;
use uuid::Uuid;

#[tokio::test]
async fn deduct_records_a_spend() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(30)).await;

    let outcome = ledger
        .deduct(user, dollars(12), order, "Applied at checkout".to_string(), TransactionType::Used, None)
        .await
        .unwrap();

    assert!(!outcome.already_deducted);
    assert_eq!(outcome.new_balance, dollars(18));
    assert_eq!(outcome.transaction.amount, -dollars(12));
    assert_eq!(outcome.transaction.order_id, Some(order));
    assert_eq!(ledger.balance(user).await.balance, dollars(18));
}

#[tokio::test]
async fn deduct_rejects_insufficient_balance() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(5)).await;

    let err = ledger
        .deduct(user, dollars(10), Uuid::new_v4(), "Spend".to_string(), TransactionType::Used, None)
        .await;

    assert!(matches!(err, Err(AppError::BadRequest(_))));
    assert_eq!(ledger.balance(user).await.balance, dollars(5));
}

#[tokio::test]
async fn repeated_deduct_for_same_order_applies_once() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(30)).await;

    let first = ledger
        .deduct(user, dollars(12), order, "Spend".to_string(), TransactionType::Used, None)
        .await
        .unwrap();
    let second = ledger
        .deduct(user, dollars(12), order, "Spend".to_string(), TransactionType::Used, None)
        .await
        .unwrap();

    assert!(!first.already_deducted);
    assert!(second.already_deducted);
    assert_eq!(second.transaction.transaction_id, first.transaction.transaction_id);
    assert_eq!(ledger.balance(user).await.balance, dollars(18));
    assert_eq!(store.all().len(), 2);
}

#[tokio::test]
async fn concurrent_deducts_for_same_order_apply_once() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(30)).await;

    let a = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .deduct(user, dollars(12), order, "Spend".to_string(), TransactionType::Used, None)
                .await
        })
    };
    let b = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .deduct(user, dollars(12), order, "Spend".to_string(), TransactionType::Used, None)
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let used: Vec<_> = store
        .all()
        .into_iter()
        .filter(|t| t.transaction_type == "used")
        .collect();
    assert_eq!(used.len(), 1);
    assert_eq!(ledger.balance(user).await.balance, dollars(18));
}

#[tokio::test]
async fn deduct_records_the_given_type() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(30)).await;

    let outcome = ledger
        .deduct(
            user,
            dollars(6),
            order,
            "Support correction".to_string(),
            TransactionType::Adjustment,
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.transaction.transaction_type, "adjustment");
    assert_eq!(outcome.new_balance, dollars(24));
}

#[tokio::test]
async fn reversing_a_spend_restores_the_balance() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(30)).await;
    let outcome = ledger
        .deduct(user, dollars(12), order, "Spend".to_string(), TransactionType::Used, None)
        .await
        .unwrap();

    let reversal = ledger
        .reverse(outcome.transaction.transaction_id, "Support refund")
        .await
        .unwrap();

    assert!(!reversal.released_hold);
    assert_eq!(reversal.restored, dollars(12));
    assert_eq!(reversal.transaction.transaction_type, "adjustment");
    assert_eq!(ledger.balance(user).await.balance, dollars(30));
    // The original spend row is preserved for audit.
    assert_eq!(store.all().len(), 3);
}

#[tokio::test]
async fn reversing_a_hold_deletes_it() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;
    let reservation = ledger
        .reserve(user, dollars(8), "Checkout hold", "cs_checkout")
        .await
        .unwrap();

    let reversal = ledger
        .reverse(reservation.transaction_id, "Checkout abandoned")
        .await
        .unwrap();

    assert!(reversal.released_hold);
    assert_eq!(reversal.restored, dollars(8));
    assert_eq!(ledger.balance(user).await.balance, dollars(20));
    assert_eq!(store.all().len(), 1);
}

#[tokio::test]
async fn reversing_missing_transaction_is_not_found() {
    let (ledger, _) = ledger();
    let err = ledger.reverse(Uuid::new_v4(), "Nothing there").await;
    assert!(matches!(err, Err(AppError::NotFound(_))));
}
