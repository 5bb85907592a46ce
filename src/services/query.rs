use std::sync::Arc;

use crate::domain::Transaction;
use crate::error::AppError;
use crate::gateway::models::{
    Charge, CreateTokenRequest, Customer, GatewayTransaction, ListPage, Pagination, Token,
};
use crate::ports::{GatewayClient, LedgerStore};
use crate::validation::validate_identifier;

/// Read-only views over the gateway and the ledger, plus the token and
/// card-attachment pass-throughs. Nothing here writes to the ledger.
#[derive(Clone)]
pub struct QueryService {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn GatewayClient>,
}

impl QueryService {
    pub fn new(ledger: Arc<dyn LedgerStore>, gateway: Arc<dyn GatewayClient>) -> Self {
        Self { ledger, gateway }
    }

    pub async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge, AppError> {
        validate_identifier("charge_id", charge_id)?;
        self.gateway
            .retrieve_charge(charge_id)
            .await
            .map_err(AppError::from_gateway)
    }

    pub async fn list_charges(&self, page: Pagination) -> Result<ListPage<Charge>, AppError> {
        self.gateway
            .list_charges(page)
            .await
            .map_err(AppError::from_gateway)
    }

    pub async fn retrieve_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayTransaction, AppError> {
        validate_identifier("transaction_id", transaction_id)?;
        self.gateway
            .retrieve_transaction(transaction_id)
            .await
            .map_err(AppError::from_gateway)
    }

    pub async fn list_customers(&self, page: Pagination) -> Result<ListPage<Customer>, AppError> {
        self.gateway
            .list_customers(page)
            .await
            .map_err(AppError::from_gateway)
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<Customer, AppError> {
        validate_identifier("customer_id", customer_id)?;
        self.gateway
            .get_customer(customer_id)
            .await
            .map_err(AppError::from_gateway)
    }

    pub async fn create_token(&self, request: &CreateTokenRequest) -> Result<Token, AppError> {
        validate_identifier("number", &request.number)?;
        if !(1..=12).contains(&request.expiration_month) {
            return Err(AppError::InvalidRequest(
                "expiration_month: must be between 1 and 12".to_string(),
            ));
        }
        self.gateway
            .create_token(request)
            .await
            .map_err(AppError::from_gateway)
    }

    pub async fn attach_card(&self, customer_id: &str, card_token: &str) -> Result<Customer, AppError> {
        validate_identifier("customer_id", customer_id)?;
        validate_identifier("token", card_token)?;
        self.gateway
            .attach_card(customer_id, card_token)
            .await
            .map_err(AppError::from_gateway)
    }

    /// The locally recorded transaction, by charge id or reservation reference.
    pub async fn ledger_transaction(&self, id: &str) -> Result<Transaction, AppError> {
        validate_identifier("id", id)?;
        self.ledger
            .get_transaction(id)
            .await
            .map_err(AppError::from_ledger_read)
    }
}
