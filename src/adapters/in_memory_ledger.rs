//! In-memory implementation of LedgerStore.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::{ChargeStatus, Transaction, Transition, User};
use crate::ports::{
    ApplyOutcome, LedgerError, LedgerResult, LedgerStore, Reservation, StatusUpdate,
};

#[derive(Default)]
struct LedgerState {
    users: HashMap<String, User>,
    /// Keyed by `Transaction::id`.
    transactions: HashMap<String, Transaction>,
    /// Idempotency key -> transaction id.
    idempotency_keys: HashMap<String, String>,
    /// Reservation reference -> transaction id.
    references: HashMap<String, String>,
}

impl LedgerState {
    fn resolve<'a>(&'a self, id: &'a str) -> Option<&'a str> {
        if self.transactions.contains_key(id) {
            return Some(id);
        }
        self.references.get(id).map(String::as_str)
    }
}

/// Thread-safe ledger held in process memory.
///
/// One lock guards all maps so every operation is atomic with respect to the
/// others. Suitable for tests and single-instance deployments.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with empty users.
    pub fn with_users<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let users = ids
            .into_iter()
            .map(|id| {
                let user = User::new(id);
                (user.id.clone(), user)
            })
            .collect();
        Self {
            state: Arc::new(RwLock::new(LedgerState {
                users,
                ..LedgerState::default()
            })),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_user(&self, user_id: &str) -> LedgerResult<User> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))
    }

    async fn update_user(&self, user: User) -> LedgerResult<User> {
        let mut state = self.state.write().await;
        state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn record_transaction(&self, tx: Transaction) -> LedgerResult<Transaction> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&tx.user_id) {
            return Err(LedgerError::NotFound(format!("user {}", tx.user_id)));
        }
        state
            .idempotency_keys
            .insert(tx.idempotency_key.clone(), tx.id.clone());
        state.references.insert(tx.reference.clone(), tx.id.clone());
        state.transactions.insert(tx.id.clone(), tx.clone());
        Ok(tx)
    }

    async fn get_transaction(&self, id: &str) -> LedgerResult<Transaction> {
        let state = self.state.read().await;
        state
            .resolve(id)
            .and_then(|id| state.transactions.get(id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .idempotency_keys
            .get(key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn reserve_transaction(&self, tx: Transaction) -> LedgerResult<Reservation> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .idempotency_keys
            .get(&tx.idempotency_key)
            .and_then(|id| state.transactions.get(id))
        {
            return Ok(Reservation::Existing(existing.clone()));
        }
        if !state.users.contains_key(&tx.user_id) {
            return Err(LedgerError::NotFound(format!("user {}", tx.user_id)));
        }

        state
            .idempotency_keys
            .insert(tx.idempotency_key.clone(), tx.id.clone());
        state.references.insert(tx.reference.clone(), tx.id.clone());
        state.transactions.insert(tx.id.clone(), tx.clone());
        Ok(Reservation::Created(tx))
    }

    async fn settle_reservation(&self, reference: &str, tx: Transaction) -> LedgerResult<Transaction> {
        let mut state = self.state.write().await;
        let current_id = state
            .references
            .get(reference)
            .cloned()
            .ok_or_else(|| LedgerError::Conflict(format!("reservation {} is gone", reference)))?;

        match state.transactions.get(&current_id) {
            Some(current) if current.status.is_terminal() => {
                return Err(LedgerError::Conflict(format!(
                    "reservation {} already settled as {}",
                    reference, current.status
                )));
            }
            Some(_) => {}
            None => {
                return Err(LedgerError::Conflict(format!("reservation {} is gone", reference)));
            }
        }
        if current_id != tx.id && state.transactions.contains_key(&tx.id) {
            return Err(LedgerError::Conflict(format!("transaction {} already recorded", tx.id)));
        }

        state.transactions.remove(&current_id);
        state
            .idempotency_keys
            .insert(tx.idempotency_key.clone(), tx.id.clone());
        state.references.insert(reference.to_string(), tx.id.clone());
        state.transactions.insert(tx.id.clone(), tx.clone());
        Ok(tx)
    }

    async fn release_reservation(&self, reference: &str) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let Some(id) = state.references.get(reference).cloned() else {
            return Ok(());
        };
        let releasable = state
            .transactions
            .get(&id)
            .map(|tx| tx.status == ChargeStatus::Pending && tx.is_reservation());

        match releasable {
            Some(true) => {
                if let Some(tx) = state.transactions.remove(&id) {
                    state.idempotency_keys.remove(&tx.idempotency_key);
                }
                state.references.remove(reference);
                Ok(())
            }
            Some(false) => Err(LedgerError::Conflict(format!(
                "reservation {} already reached the gateway",
                reference
            ))),
            None => {
                state.references.remove(reference);
                Ok(())
            }
        }
    }

    async fn append_user_transaction(&self, user_id: &str, tx_id: &str) -> LedgerResult<User> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))?;
        user.append_transaction(tx_id);
        Ok(user.clone())
    }

    async fn apply_transition(&self, charge_id: &str, update: StatusUpdate) -> LedgerResult<ApplyOutcome> {
        let mut state = self.state.write().await;
        let tx = state
            .transactions
            .get_mut(charge_id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", charge_id)))?;

        if tx.status.is_terminal() {
            return Ok(ApplyOutcome::AlreadyTerminal(tx.clone()));
        }
        if tx.last_event_id.as_deref() == Some(update.event_id.as_str()) {
            return Ok(ApplyOutcome::DuplicateEvent(tx.clone()));
        }

        let outcome = match update.status {
            ChargeStatus::Failed => tx.fail(update.failure),
            status => tx.transition(status),
        };
        if outcome == Transition::Ignored {
            return Ok(ApplyOutcome::AlreadyTerminal(tx.clone()));
        }
        tx.last_event_id = Some(update.event_id);
        tx.updated_at = Utc::now();
        Ok(ApplyOutcome::Applied(tx.clone()))
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut all: Vec<Transaction> = state.transactions.values().cloned().collect();
        all.sort_by_key(|tx| tx.created_at);
        Ok(all)
    }
}
