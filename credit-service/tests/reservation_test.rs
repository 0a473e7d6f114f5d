mod common;

use common::{dollars, grant, ledger};
use service_core::error::AppError;
use uuid::Uuid;

#[tokio::test]
async fn reserve_holds_credit() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;

    let reservation = ledger.reserve(user, dollars(8), "Checkout hold", "cs_checkout").await.unwrap();

    assert_eq!(reservation.amount, -dollars(8));
    assert_eq!(reservation.transaction_type, "reservation_pending_payment");
    assert!(reservation.order_id.is_none());
    assert!(reservation.expires_utc.is_some());
    // Snapshot records the balance before the hold.
    assert_eq!(reservation.balance, dollars(20));
    assert_eq!(ledger.balance(user).await.balance, dollars(12));
}

#[tokio::test]
async fn reserve_rejects_insufficient_balance() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(5)).await;

    let err = ledger.reserve(user, dollars(10), "Checkout hold", "cs_checkout").await;
    assert!(matches!(err, Err(AppError::BadRequest(_))));
    assert_eq!(ledger.balance(user).await.balance, dollars(5));
}

#[tokio::test]
async fn reserve_rejects_nonpositive_amount() {
    let (ledger, _) = ledger();
    let err = ledger.reserve(Uuid::new_v4(), dollars(0), "Checkout hold", "cs_checkout").await;
    assert!(matches!(err, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn two_holds_cannot_spend_the_same_credit() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(10)).await;

    ledger
        .reserve(user, dollars(7), "Checkout hold", "cs_first")
        .await
        .unwrap();
    let err = ledger.reserve(user, dollars(7), "Checkout hold", "cs_second").await;

    assert!(matches!(err, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn confirm_realizes_reservation_as_spend() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;
    let reservation = ledger.reserve(user, dollars(8), "Checkout hold", "cs_checkout").await.unwrap();

    let outcome = ledger
        .confirm_reservation(reservation.transaction_id, order)
        .await
        .unwrap();

    assert!(!outcome.already_confirmed);
    assert_eq!(outcome.transaction.transaction_type, "used");
    assert_eq!(outcome.transaction.order_id, Some(order));
    // Confirmation changes the row's type, not the summed balance.
    assert_eq!(ledger.balance(user).await.balance, dollars(12));
    assert_eq!(store.all().len(), 2);
}

#[tokio::test]
async fn confirm_is_idempotent_for_same_order() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    let order = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;
    let reservation = ledger.reserve(user, dollars(8), "Checkout hold", "cs_checkout").await.unwrap();

    ledger
        .confirm_reservation(reservation.transaction_id, order)
        .await
        .unwrap();
    let second = ledger
        .confirm_reservation(reservation.transaction_id, order)
        .await
        .unwrap();

    assert!(second.already_confirmed);
    assert_eq!(ledger.balance(user).await.balance, dollars(12));
}

#[tokio::test]
async fn confirm_for_different_order_conflicts() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;
    let reservation = ledger.reserve(user, dollars(8), "Checkout hold", "cs_checkout").await.unwrap();

    ledger
        .confirm_reservation(reservation.transaction_id, Uuid::new_v4())
        .await
        .unwrap();
    let err = ledger
        .confirm_reservation(reservation.transaction_id, Uuid::new_v4())
        .await;

    assert!(matches!(err, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn confirm_missing_transaction_is_not_found() {
    let (ledger, _) = ledger();
    let err = ledger
        .confirm_reservation(Uuid::new_v4(), Uuid::new_v4())
        .await;
    assert!(matches!(err, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn cancel_releases_the_hold() {
    let (ledger, store) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;
    let reservation = ledger.reserve(user, dollars(8), "Checkout hold", "cs_checkout").await.unwrap();

    let cancelled = ledger
        .cancel_reservation(reservation.transaction_id, "Customer removed credit")
        .await
        .unwrap();

    assert!(cancelled);
    assert_eq!(ledger.balance(user).await.balance, dollars(20));
    assert_eq!(store.all().len(), 1);
}

#[tokio::test]
async fn cancel_absent_reservation_succeeds() {
    let (ledger, _) = ledger();
    let cancelled = ledger
        .cancel_reservation(Uuid::new_v4(), "Customer removed credit")
        .await
        .unwrap();
    assert!(!cancelled);
}

#[tokio::test]
async fn cancel_confirmed_transaction_conflicts() {
    let (ledger, _) = ledger();
    let user = Uuid::new_v4();
    grant(&ledger, user, dollars(20)).await;
    let reservation = ledger.reserve(user, dollars(8), "Checkout hold", "cs_checkout").await.unwrap();
    ledger
        .confirm_reservation(reservation.transaction_id, Uuid::new_v4())
        .await
        .unwrap();

    let err = ledger
        .cancel_reservation(reservation.transaction_id, "Customer removed credit")
        .await;
    assert!(matches!(err, Err(AppError::Conflict(_))));
}
