//! Charge orchestration.
//!
//! Every charge is reserved in the ledger under its idempotency key before the
//! gateway is contacted, then settled under the gateway's charge id. A gateway
//! communication failure releases the reservation so the caller can retry with
//! the same key; a ledger failure after a successful gateway call surfaces as
//! `LedgerWriteFailed`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::locks::KeyedLocks;
use crate::domain::{
    ChargeMethod, ChargeStatus, FailureDetail, IdempotencyKey, ReportedStatus, Transaction,
};
use crate::error::AppError;
use crate::gateway::models::{
    Charge, CreateChargeRequest, METADATA_IDEMPOTENCY_KEY, METADATA_USER_ID,
};
use crate::ports::{GatewayClient, LedgerError, LedgerStore, Reservation};
use crate::validation::{
    normalize_currency, validate_identifier, validate_nonce, validate_positive_amount,
};

/// Explicit settings for [`ChargeOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_currency: String,
    /// Where the bank sends the customer after authorization.
    pub bank_return_uri: String,
    /// Upper bound on a single gateway call, including time spent holding the
    /// idempotency key.
    pub gateway_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CardChargeRequest {
    pub amount: i64,
    pub currency: Option<String>,
    pub card_token: String,
    pub user_id: String,
    /// Caller-supplied request nonce. Retries must resend the same value.
    pub nonce: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BankChargeRequest {
    pub amount: i64,
    pub currency: Option<String>,
    pub source: String,
    pub user_id: String,
    pub nonce: Option<String>,
}

/// What a charge request produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeReceipt {
    pub transaction: Transaction,
    /// Redirect for bank or 3-D Secure authorization. Never stored.
    pub authorize_uri: Option<String>,
    /// True when an earlier request with the same idempotency key produced it.
    pub replayed: bool,
}

struct ChargeIntent {
    method: ChargeMethod,
    user_id: String,
    instrument: String,
    amount: i64,
    currency: String,
    nonce: String,
}

pub struct ChargeOrchestrator {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn GatewayClient>,
    config: OrchestratorConfig,
    locks: KeyedLocks,
}

impl ChargeOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn GatewayClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Charges a tokenized card and records the outcome.
    pub async fn charge_card(&self, request: CardChargeRequest) -> Result<ChargeReceipt, AppError> {
        validate_identifier("token", &request.card_token)?;
        let intent = self.intent(
            ChargeMethod::Card,
            request.user_id,
            request.card_token,
            request.amount,
            request.currency,
            request.nonce,
        )?;
        self.execute(intent).await
    }

    /// Starts a bank charge. The result is `AwaitingAuthorization`; only the
    /// webhook reconciler settles it.
    pub async fn charge_banking(&self, request: BankChargeRequest) -> Result<ChargeReceipt, AppError> {
        validate_identifier("source", &request.source)?;
        let intent = self.intent(
            ChargeMethod::Banking,
            request.user_id,
            request.source,
            request.amount,
            request.currency,
            request.nonce,
        )?;
        self.execute(intent).await
    }

    fn intent(
        &self,
        method: ChargeMethod,
        user_id: String,
        instrument: String,
        amount: i64,
        currency: Option<String>,
        nonce: Option<String>,
    ) -> Result<ChargeIntent, AppError> {
        validate_identifier("user_id", &user_id)?;
        validate_positive_amount(amount)?;
        let currency = normalize_currency(currency.as_deref().unwrap_or(&self.config.default_currency))?;
        let nonce = match nonce {
            Some(nonce) => {
                validate_nonce(&nonce)?;
                nonce
            }
            None => Uuid::new_v4().to_string(),
        };

        Ok(ChargeIntent {
            method,
            user_id,
            instrument,
            amount,
            currency,
            nonce,
        })
    }

    async fn execute(&self, intent: ChargeIntent) -> Result<ChargeReceipt, AppError> {
        self.ledger.get_user(&intent.user_id).await.map_err(|e| match e {
            LedgerError::NotFound(_) => AppError::UserNotFound(intent.user_id.clone()),
            other => AppError::Internal(other.to_string()),
        })?;

        let key = IdempotencyKey::derive(
            &intent.user_id,
            &intent.instrument,
            intent.amount,
            &intent.currency,
            &intent.nonce,
        );
        let _guard = self.locks.lock(key.as_str()).await;

        let candidate = Transaction::reserve(
            &intent.user_id,
            intent.amount,
            &intent.currency,
            intent.method,
            key.as_str(),
        );
        let reserved = match self.ledger.reserve_transaction(candidate).await {
            Ok(Reservation::Created(tx)) => tx,
            Ok(Reservation::Existing(tx)) => {
                info!(
                    charge_id = %tx.id,
                    user_id = %tx.user_id,
                    idempotency_key = %key,
                    status = %tx.status,
                    "Duplicate charge request, returning existing record"
                );
                return self.replay(tx).await;
            }
            Err(LedgerError::NotFound(_)) => return Err(AppError::UserNotFound(intent.user_id)),
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "could not reserve charge for user {}: {}",
                    intent.user_id, e
                )))
            }
        };
        debug!(reference = %reserved.reference, idempotency_key = %key, "Charge reserved");

        let request = self.gateway_request(&intent, &key);
        let charge = match tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.create_charge(&request),
        )
        .await
        {
            Ok(Ok(charge)) => charge,
            Ok(Err(e)) => return Err(self.abandon(&reserved, e.to_string()).await),
            Err(_) => {
                let reason = format!("no response within {:?}", self.config.gateway_timeout);
                return Err(self.abandon(&reserved, reason).await);
            }
        };

        self.settle(reserved, charge).await
    }

    fn gateway_request(&self, intent: &ChargeIntent, key: &IdempotencyKey) -> CreateChargeRequest {
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), intent.user_id.clone());
        metadata.insert(METADATA_IDEMPOTENCY_KEY.to_string(), key.to_string());

        let (card, source, return_uri) = match intent.method {
            ChargeMethod::Card => (Some(intent.instrument.clone()), None, None),
            ChargeMethod::Banking => (
                None,
                Some(intent.instrument.clone()),
                Some(self.config.bank_return_uri.clone()),
            ),
        };

        CreateChargeRequest {
            amount: intent.amount,
            currency: intent.currency.clone(),
            card,
            source,
            return_uri,
            metadata,
        }
    }

    /// The gateway call never produced a decision. Drop the reservation so a
    /// retry with the same key charges again.
    async fn abandon(&self, reserved: &Transaction, reason: String) -> AppError {
        warn!(
            reference = %reserved.reference,
            user_id = %reserved.user_id,
            reason = %reason,
            "Gateway call failed, releasing reservation"
        );
        if let Err(e) = self.ledger.release_reservation(&reserved.reference).await {
            error!(
                reference = %reserved.reference,
                user_id = %reserved.user_id,
                "Failed to release reservation: {}", e
            );
        }
        AppError::GatewayUnavailable(format!(
            "charge for user {} was not created: {}",
            reserved.user_id, reason
        ))
    }

    async fn settle(&self, reserved: Transaction, charge: Charge) -> Result<ChargeReceipt, AppError> {
        let mut tx = reserved.clone();
        tx.id = charge.id.clone();
        apply_gateway_status(&mut tx, &charge);

        let user_id = reserved.user_id.clone();
        let settled = self
            .ledger
            .settle_reservation(&reserved.reference, tx)
            .await
            .map_err(|e| ledger_write_failed(&charge.id, &user_id, e))?;
        self.ledger
            .append_user_transaction(&user_id, &settled.id)
            .await
            .map_err(|e| ledger_write_failed(&charge.id, &user_id, e))?;

        info!(
            charge_id = %settled.id,
            user_id = %user_id,
            amount = settled.amount,
            currency = %settled.currency,
            status = %settled.status,
            "Charge recorded"
        );
        receipt(settled, charge.authorize_uri, false)
    }

    async fn replay(&self, existing: Transaction) -> Result<ChargeReceipt, AppError> {
        if existing.is_reservation() {
            return receipt(existing, None, true);
        }

        // A previous attempt may have failed between settling and appending.
        self.ledger
            .append_user_transaction(&existing.user_id, &existing.id)
            .await
            .map_err(|e| ledger_write_failed(&existing.id, &existing.user_id, e))?;

        let authorize_uri = if existing.status == ChargeStatus::AwaitingAuthorization {
            self.lookup_authorize_uri(&existing.id).await
        } else {
            None
        };
        receipt(existing, authorize_uri, true)
    }

    async fn lookup_authorize_uri(&self, charge_id: &str) -> Option<String> {
        match tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.retrieve_charge(charge_id),
        )
        .await
        {
            Ok(Ok(charge)) => charge.authorize_uri,
            Ok(Err(e)) => {
                warn!(charge_id = %charge_id, "Could not refresh authorize URI: {}", e);
                None
            }
            Err(_) => {
                warn!(charge_id = %charge_id, "Timed out refreshing authorize URI");
                None
            }
        }
    }
}

/// Maps the gateway's synchronous answer onto the reservation. Bank charges
/// never become `Captured` here.
pub(crate) fn apply_gateway_status(tx: &mut Transaction, charge: &Charge) {
    match (tx.method, charge.status) {
        (_, ReportedStatus::Failed) => {
            tx.fail(FailureDetail {
                code: charge.failure_code.clone(),
                message: charge.failure_message.clone(),
            });
        }
        (_, ReportedStatus::Expired) => {
            tx.transition(ChargeStatus::Expired);
        }
        (ChargeMethod::Card, ReportedStatus::Successful) => {
            tx.transition(ChargeStatus::Captured);
        }
        _ => {
            tx.transition(ChargeStatus::AwaitingAuthorization);
        }
    }
}

fn receipt(
    transaction: Transaction,
    authorize_uri: Option<String>,
    replayed: bool,
) -> Result<ChargeReceipt, AppError> {
    if transaction.status == ChargeStatus::Failed {
        return Err(AppError::GatewayDeclined {
            charge_id: transaction.id,
            code: transaction.failure_code,
            message: transaction.failure_message,
        });
    }
    Ok(ChargeReceipt {
        transaction,
        authorize_uri,
        replayed,
    })
}

fn ledger_write_failed(charge_id: &str, user_id: &str, e: LedgerError) -> AppError {
    error!(
        charge_id = %charge_id,
        user_id = %user_id,
        "Charge exists at the gateway but the ledger write failed: {}", e
    );
    AppError::LedgerWriteFailed {
        charge_id: charge_id.to_string(),
        user_id: user_id.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charge(status: ReportedStatus) -> Charge {
        Charge {
            id: "chrg_test_1".to_string(),
            amount: 1000,
            currency: "thb".to_string(),
            status,
            authorize_uri: None,
            failure_code: Some("insufficient_fund".to_string()),
            failure_message: Some("insufficient funds".to_string()),
            transaction: None,
            source: None,
            metadata: BTreeMap::new(),
            created_at: None,
        }
    }

    fn reserved(method: ChargeMethod) -> Transaction {
        Transaction::reserve("1", 1000, "thb", method, "key")
    }

    #[test]
    fn test_successful_card_is_captured() {
        let mut tx = reserved(ChargeMethod::Card);
        apply_gateway_status(&mut tx, &charge(ReportedStatus::Successful));
        assert_eq!(tx.status, ChargeStatus::Captured);
    }

    #[test]
    fn test_successful_bank_still_awaits_webhook() {
        let mut tx = reserved(ChargeMethod::Banking);
        apply_gateway_status(&mut tx, &charge(ReportedStatus::Successful));
        assert_eq!(tx.status, ChargeStatus::AwaitingAuthorization);
    }

    #[test]
    fn test_pending_card_awaits_authorization() {
        let mut tx = reserved(ChargeMethod::Card);
        apply_gateway_status(&mut tx, &charge(ReportedStatus::Pending));
        assert_eq!(tx.status, ChargeStatus::AwaitingAuthorization);
    }

    #[test]
    fn test_decline_records_failure_and_surfaces_declined() {
        let mut tx = reserved(ChargeMethod::Card);
        apply_gateway_status(&mut tx, &charge(ReportedStatus::Failed));
        assert_eq!(tx.failure_code.as_deref(), Some("insufficient_fund"));

        let result = receipt(tx, None, false);
        assert!(matches!(result, Err(AppError::GatewayDeclined { .. })));
    }
}
