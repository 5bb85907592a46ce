#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use charge_ledger::adapters::InMemoryLedgerStore;
use charge_ledger::domain::{ReportedStatus, Transaction, User};
use charge_ledger::gateway::models::{
    Card, Charge, ChargeSource, CreateChargeRequest, CreateTokenRequest, Customer,
    GatewayTransaction, ListPage, Pagination, Token,
};
use charge_ledger::gateway::{CircuitState, GatewayError};
use charge_ledger::ports::{
    ApplyOutcome, GatewayClient, GatewayResult, LedgerError, LedgerResult, LedgerStore,
    Reservation, StatusUpdate,
};
use charge_ledger::services::{ChargeOrchestrator, OrchestratorConfig};

pub const USER_ID: &str = "1";
pub const RETURN_URI: &str = "https://shop.example/orders/complete";
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// How the fake answers the next `create_charge`.
#[derive(Debug, Clone)]
pub enum Scripted {
    Status(ReportedStatus),
    Decline { code: &'static str, message: &'static str },
    Unavailable,
}

/// Scripted in-process gateway.
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<VecDeque<Scripted>>,
    charges: Mutex<Vec<Charge>>,
    create_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    hold: Mutex<Option<Arc<Semaphore>>>,
    circuit_open: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, next: Scripted) {
        self.script.lock().unwrap().push_back(next);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn clear_delay(&self) {
        *self.delay.lock().unwrap() = None;
    }

    /// Makes `create_charge` record the charge in history and then wait for
    /// a permit on the returned gate before answering.
    pub fn hold_after_create(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.hold.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn open_circuit(&self) {
        self.circuit_open.store(true, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Inserts a charge into the gateway's history directly.
    pub fn insert_charge(&self, charge: Charge) {
        self.charges.lock().unwrap().push(charge);
    }

    pub fn set_status(&self, charge_id: &str, status: ReportedStatus) {
        let mut charges = self.charges.lock().unwrap();
        if let Some(charge) = charges.iter_mut().find(|c| c.id == charge_id) {
            charge.status = status;
        }
    }
}

pub fn charge(id: &str, amount: i64, status: ReportedStatus) -> Charge {
    Charge {
        id: id.to_string(),
        amount,
        currency: "thb".to_string(),
        status,
        authorize_uri: None,
        failure_code: None,
        failure_message: None,
        transaction: None,
        source: None,
        metadata: Default::default(),
        created_at: None,
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn create_charge(&self, request: &CreateChargeRequest) -> GatewayResult<Charge> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let id = format!("chrg_test_{}", n);
        let mut created = charge(&id, request.amount, ReportedStatus::Pending);
        created.currency = request.currency.clone();
        created.metadata = request.metadata.clone();
        if let Some(source) = &request.source {
            created.source = Some(ChargeSource {
                id: source.clone(),
                kind: Some("internet_banking_bbl".to_string()),
            });
            created.authorize_uri = Some(format!("https://bank.example/authorize/{}", id));
        }

        created.status = match scripted {
            Some(Scripted::Unavailable) => {
                return Err(GatewayError::Api {
                    status: 503,
                    code: "service_unavailable".to_string(),
                    message: "try again later".to_string(),
                })
            }
            Some(Scripted::Decline { code, message }) => {
                created.failure_code = Some(code.to_string());
                created.failure_message = Some(message.to_string());
                ReportedStatus::Failed
            }
            Some(Scripted::Status(status)) => status,
            None if request.source.is_some() => ReportedStatus::Pending,
            None => ReportedStatus::Successful,
        };

        self.charges.lock().unwrap().push(created.clone());

        let hold = self.hold.lock().unwrap().clone();
        if let Some(gate) = hold {
            let _permit = gate.acquire().await;
        }
        Ok(created)
    }

    async fn retrieve_charge(&self, charge_id: &str) -> GatewayResult<Charge> {
        self.charges
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == charge_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("charge {}", charge_id)))
    }

    async fn list_charges(&self, page: Pagination) -> GatewayResult<ListPage<Charge>> {
        let charges = self.charges.lock().unwrap();
        let data = charges
            .iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(ListPage {
            data,
            limit: page.limit,
            offset: page.offset,
            total: charges.len() as u32,
        })
    }

    async fn retrieve_transaction(&self, transaction_id: &str) -> GatewayResult<GatewayTransaction> {
        Err(GatewayError::NotFound(format!("transaction {}", transaction_id)))
    }

    async fn create_token(&self, request: &CreateTokenRequest) -> GatewayResult<Token> {
        let last_digits = request.number.chars().rev().take(4).collect::<Vec<_>>();
        Ok(Token {
            id: "tokn_test_1".to_string(),
            used: false,
            card: Card {
                id: "card_test_1".to_string(),
                brand: Some("Visa".to_string()),
                last_digits: Some(last_digits.into_iter().rev().collect()),
                name: Some(request.name.clone()),
                expiration_month: Some(request.expiration_month),
                expiration_year: Some(request.expiration_year),
            },
        })
    }

    async fn list_customers(&self, page: Pagination) -> GatewayResult<ListPage<Customer>> {
        Ok(ListPage {
            data: Vec::new(),
            limit: page.limit,
            offset: page.offset,
            total: 0,
        })
    }

    async fn get_customer(&self, customer_id: &str) -> GatewayResult<Customer> {
        Err(GatewayError::NotFound(format!("customer {}", customer_id)))
    }

    async fn attach_card(&self, customer_id: &str, _card_token: &str) -> GatewayResult<Customer> {
        Err(GatewayError::NotFound(format!("customer {}", customer_id)))
    }

    fn circuit_state(&self) -> CircuitState {
        if self.circuit_open.load(Ordering::SeqCst) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

/// Ledger wrapper whose settle and transition writes can be made to fail.
pub struct FlakyLedger {
    pub inner: InMemoryLedgerStore,
    fail_writes: Mutex<bool>,
}

impl FlakyLedger {
    pub fn new(inner: InMemoryLedgerStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: Mutex::new(false),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    fn check(&self) -> LedgerResult<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(LedgerError::Backend("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn get_user(&self, user_id: &str) -> LedgerResult<User> {
        self.inner.get_user(user_id).await
    }

    async fn update_user(&self, user: User) -> LedgerResult<User> {
        self.inner.update_user(user).await
    }

    async fn record_transaction(&self, tx: Transaction) -> LedgerResult<Transaction> {
        self.check()?;
        self.inner.record_transaction(tx).await
    }

    async fn get_transaction(&self, id: &str) -> LedgerResult<Transaction> {
        self.inner.get_transaction(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Transaction>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn reserve_transaction(&self, tx: Transaction) -> LedgerResult<Reservation> {
        self.inner.reserve_transaction(tx).await
    }

    async fn settle_reservation(&self, reference: &str, tx: Transaction) -> LedgerResult<Transaction> {
        self.check()?;
        self.inner.settle_reservation(reference, tx).await
    }

    async fn release_reservation(&self, reference: &str) -> LedgerResult<()> {
        self.inner.release_reservation(reference).await
    }

    async fn append_user_transaction(&self, user_id: &str, tx_id: &str) -> LedgerResult<User> {
        self.inner.append_user_transaction(user_id, tx_id).await
    }

    async fn apply_transition(&self, charge_id: &str, update: StatusUpdate) -> LedgerResult<ApplyOutcome> {
        self.check()?;
        self.inner.apply_transition(charge_id, update).await
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<Transaction>> {
        self.inner.list_transactions().await
    }
}

pub fn orchestrator_config(timeout: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        default_currency: "thb".to_string(),
        bank_return_uri: RETURN_URI.to_string(),
        gateway_timeout: timeout,
    }
}

pub struct Harness {
    pub ledger: InMemoryLedgerStore,
    pub gateway: Arc<FakeGateway>,
    pub orchestrator: ChargeOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let ledger = InMemoryLedgerStore::with_users([USER_ID]);
        let gateway = FakeGateway::new();
        let orchestrator = ChargeOrchestrator::new(
            Arc::new(ledger.clone()),
            gateway.clone(),
            orchestrator_config(timeout),
        );
        Self {
            ledger,
            gateway,
            orchestrator,
        }
    }
}
