//! Collaborator contracts consumed by the charge core.
//! The orchestrator and reconciler only ever see these traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ChargeStatus, FailureDetail, Transaction, User};
use crate::gateway::models::{
    Charge, CreateChargeRequest, CreateTokenRequest, Customer, GatewayTransaction,
    ListPage, Pagination, Token,
};
use crate::gateway::{CircuitState, GatewayError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ledger backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => LedgerError::NotFound("row not found".to_string()),
            other => LedgerError::Backend(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Outcome of reserving an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// This caller owns the new reservation.
    Created(Transaction),
    /// Another request already holds the key; this is its current record.
    Existing(Transaction),
}

/// A terminal status change to apply, tagged with the event that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ChargeStatus,
    pub failure: FailureDetail,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Transaction),
    /// The record had already left the non-terminal states.
    AlreadyTerminal(Transaction),
    /// The record's last applied event is the same event.
    DuplicateEvent(Transaction),
}

/// Durable record of users and their transactions.
///
/// Every method is atomic on its own key. Callers never hold a copy across
/// a gateway call and write it back.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> LedgerResult<User>;

    async fn update_user(&self, user: User) -> LedgerResult<User>;

    /// Upsert keyed by `tx.id`.
    async fn record_transaction(&self, tx: Transaction) -> LedgerResult<Transaction>;

    /// Looks a transaction up by its current id or its reservation reference.
    async fn get_transaction(&self, id: &str) -> LedgerResult<Transaction>;

    /// The record currently holding `key`, if any.
    async fn find_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Transaction>>;

    /// Inserts `tx` unless its idempotency key is already taken.
    async fn reserve_transaction(&self, tx: Transaction) -> LedgerResult<Reservation>;

    /// Replaces the reservation `reference` with `tx`, which carries the
    /// gateway charge id. Fails with `Conflict` if the reservation is gone or
    /// already terminal.
    async fn settle_reservation(&self, reference: &str, tx: Transaction) -> LedgerResult<Transaction>;

    /// Drops a reservation that never reached a gateway decision so its key
    /// can be retried.
    async fn release_reservation(&self, reference: &str) -> LedgerResult<()>;

    /// Appends `tx_id` to the user's collection unless already present.
    async fn append_user_transaction(&self, user_id: &str, tx_id: &str) -> LedgerResult<User>;

    /// Conditional status change: only from a non-terminal state, and only if
    /// `update.event_id` differs from the last applied event.
    async fn apply_transition(&self, charge_id: &str, update: StatusUpdate) -> LedgerResult<ApplyOutcome>;

    async fn list_transactions(&self) -> LedgerResult<Vec<Transaction>>;
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Remote payment gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_charge(&self, request: &CreateChargeRequest) -> GatewayResult<Charge>;

    async fn retrieve_charge(&self, charge_id: &str) -> GatewayResult<Charge>;

    async fn list_charges(&self, page: Pagination) -> GatewayResult<ListPage<Charge>>;

    async fn retrieve_transaction(&self, transaction_id: &str) -> GatewayResult<GatewayTransaction>;

    async fn create_token(&self, request: &CreateTokenRequest) -> GatewayResult<Token>;

    async fn list_customers(&self, page: Pagination) -> GatewayResult<ListPage<Customer>>;

    async fn get_customer(&self, customer_id: &str) -> GatewayResult<Customer>;

    async fn attach_card(&self, customer_id: &str, card_token: &str) -> GatewayResult<Customer>;

    fn circuit_state(&self) -> CircuitState {
        CircuitState::Closed
    }
}
