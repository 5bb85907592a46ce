mod common;

use std::sync::Arc;
use std::time::Duration;

use charge_ledger::domain::{ChargeStatus, ReportedStatus};
use charge_ledger::error::AppError;
use charge_ledger::ports::LedgerStore;
use charge_ledger::services::{BankChargeRequest, CardChargeRequest, ChargeOrchestrator};
use common::{FakeGateway, FlakyLedger, Harness, Scripted, USER_ID};

fn card(amount: i64, nonce: &str) -> CardChargeRequest {
    CardChargeRequest {
        amount,
        currency: Some("thb".to_string()),
        card_token: "tokn_test_5g5mep".to_string(),
        user_id: USER_ID.to_string(),
        nonce: Some(nonce.to_string()),
    }
}

fn bank(amount: i64, nonce: &str) -> BankChargeRequest {
    BankChargeRequest {
        amount,
        currency: None,
        source: "src_test_bbl".to_string(),
        user_id: USER_ID.to_string(),
        nonce: Some(nonce.to_string()),
    }
}

#[tokio::test]
async fn test_card_charge_is_captured_and_appended_once() {
    let h = Harness::new();

    let receipt = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();

    assert_eq!(receipt.transaction.status, ChargeStatus::Captured);
    assert_eq!(receipt.transaction.amount, 1000);
    assert_eq!(receipt.transaction.currency, "thb");
    assert!(!receipt.replayed);

    let user = h.ledger.get_user(USER_ID).await.unwrap();
    assert_eq!(user.transactions, vec![receipt.transaction.id.clone()]);

    let stored = h.ledger.get_transaction(&receipt.transaction.id).await.unwrap();
    assert_eq!(stored.status, ChargeStatus::Captured);
}

#[tokio::test]
async fn test_retry_with_same_nonce_replays_without_charging_again() {
    let h = Harness::new();

    let first = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();
    let second = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();

    assert_eq!(h.gateway.create_calls(), 1);
    assert_eq!(first.transaction.id, second.transaction.id);
    assert!(second.replayed);

    let user = h.ledger.get_user(USER_ID).await.unwrap();
    assert_eq!(user.transactions.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_make_one_gateway_call() {
    let h = Harness::new();
    h.gateway.set_delay(Duration::from_millis(50));
    let orchestrator = Arc::new(h.orchestrator);

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.charge_card(card(1000, "order-1")).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().transaction.id);
    }

    assert_eq!(h.gateway.create_calls(), 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.ledger.list_transactions().await.unwrap().len(), 1);
    assert_eq!(h.ledger.get_user(USER_ID).await.unwrap().transactions.len(), 1);
}

#[tokio::test]
async fn test_different_nonces_are_independent_charges() {
    let h = Harness::new();

    let first = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();
    let second = h.orchestrator.charge_card(card(1000, "order-2")).await.unwrap();

    assert_ne!(first.transaction.id, second.transaction.id);
    assert_eq!(h.gateway.create_calls(), 2);
}

#[tokio::test]
async fn test_decline_is_recorded_as_failed_and_surfaced() {
    let h = Harness::new();
    h.gateway.push(Scripted::Decline {
        code: "insufficient_fund",
        message: "insufficient funds in the account",
    });

    let err = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap_err();

    let AppError::GatewayDeclined { charge_id, code, .. } = err else {
        panic!("expected a decline, got {:?}", err);
    };
    assert_eq!(code.as_deref(), Some("insufficient_fund"));

    let stored = h.ledger.get_transaction(&charge_id).await.unwrap();
    assert_eq!(stored.status, ChargeStatus::Failed);
    assert_eq!(stored.failure_code.as_deref(), Some("insufficient_fund"));

    // Replays keep reporting the decline without another gateway call.
    let again = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap_err();
    assert!(matches!(again, AppError::GatewayDeclined { .. }));
    assert_eq!(h.gateway.create_calls(), 1);
}

#[tokio::test]
async fn test_gateway_failure_leaves_no_record_and_is_retryable() {
    let h = Harness::new();
    h.gateway.push(Scripted::Unavailable);

    let err = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap_err();
    assert!(matches!(err, AppError::GatewayUnavailable(_)));
    assert!(err.is_retryable());
    assert!(h.ledger.list_transactions().await.unwrap().is_empty());
    assert!(h.ledger.get_user(USER_ID).await.unwrap().transactions.is_empty());

    let receipt = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();
    assert_eq!(receipt.transaction.status, ChargeStatus::Captured);
    assert_eq!(h.gateway.create_calls(), 2);
}

#[tokio::test]
async fn test_gateway_timeout_is_unavailable_and_releases_the_key() {
    let h = Harness::with_timeout(Duration::from_millis(20));
    h.gateway.set_delay(Duration::from_millis(200));

    let err = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap_err();
    assert!(matches!(err, AppError::GatewayUnavailable(_)));
    assert!(h.ledger.list_transactions().await.unwrap().is_empty());

    h.gateway.clear_delay();
    let receipt = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();
    assert_eq!(receipt.transaction.status, ChargeStatus::Captured);
}

#[tokio::test]
async fn test_ledger_failure_after_charge_is_reported_distinctly() {
    let inner = charge_ledger::adapters::InMemoryLedgerStore::with_users([USER_ID]);
    let ledger = FlakyLedger::new(inner);
    let gateway = FakeGateway::new();
    let orchestrator = ChargeOrchestrator::new(
        ledger.clone(),
        gateway.clone(),
        common::orchestrator_config(Duration::from_secs(5)),
    );
    ledger.fail_writes(true);

    let err = orchestrator.charge_card(card(1000, "order-1")).await.unwrap_err();

    let AppError::LedgerWriteFailed { charge_id, user_id, .. } = err else {
        panic!("expected LedgerWriteFailed, got {:?}", err);
    };
    assert_eq!(charge_id, "chrg_test_1");
    assert_eq!(user_id, USER_ID);
    assert_eq!(gateway.create_calls(), 1);
}

#[tokio::test]
async fn test_invalid_requests_never_reach_the_gateway() {
    let h = Harness::new();

    let err = h.orchestrator.charge_card(card(0, "order-1")).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let mut request = card(1000, "order-2");
    request.currency = Some("baht".to_string());
    let err = h.orchestrator.charge_card(request).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let mut request = card(1000, "order-3");
    request.user_id = "404".to_string();
    let err = h.orchestrator.charge_card(request).await.unwrap_err();
    assert!(matches!(err, AppError::UserNotFound(_)));

    assert_eq!(h.gateway.create_calls(), 0);
}

#[tokio::test]
async fn test_bank_charge_awaits_authorization_with_redirect() {
    let h = Harness::new();

    let receipt = h.orchestrator.charge_banking(bank(5000, "order-1")).await.unwrap();

    assert_eq!(receipt.transaction.status, ChargeStatus::AwaitingAuthorization);
    assert_eq!(
        receipt.authorize_uri.as_deref(),
        Some("https://bank.example/authorize/chrg_test_1")
    );
    assert_eq!(h.ledger.get_user(USER_ID).await.unwrap().transactions.len(), 1);
}

#[tokio::test]
async fn test_bank_charge_reported_successful_is_not_captured_synchronously() {
    let h = Harness::new();
    h.gateway.push(Scripted::Status(ReportedStatus::Successful));

    let receipt = h.orchestrator.charge_banking(bank(5000, "order-1")).await.unwrap();
    assert_eq!(receipt.transaction.status, ChargeStatus::AwaitingAuthorization);
}

#[tokio::test]
async fn test_bank_replay_refreshes_redirect() {
    let h = Harness::new();

    h.orchestrator.charge_banking(bank(5000, "order-1")).await.unwrap();
    let replay = h.orchestrator.charge_banking(bank(5000, "order-1")).await.unwrap();

    assert!(replay.replayed);
    assert_eq!(
        replay.authorize_uri.as_deref(),
        Some("https://bank.example/authorize/chrg_test_1")
    );
    assert_eq!(h.gateway.create_calls(), 1);
}

#[tokio::test]
async fn test_pending_card_charge_awaits_authorization() {
    let h = Harness::new();
    h.gateway.push(Scripted::Status(ReportedStatus::Pending));

    let receipt = h.orchestrator.charge_card(card(1000, "order-1")).await.unwrap();
    assert_eq!(receipt.transaction.status, ChargeStatus::AwaitingAuthorization);
}
