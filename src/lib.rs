pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod utils;
pub mod validation;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::middleware::{request_logger, RequestLogging};
use crate::ports::{GatewayClient, LedgerStore};
use crate::services::{ChargeOrchestrator, OrchestratorConfig, QueryService, WebhookReconciler};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChargeOrchestrator>,
    pub reconciler: Arc<WebhookReconciler>,
    pub query: QueryService,
    pub gateway: Arc<dyn GatewayClient>,
    pub webhook_secret: String,
    pub request_logging: RequestLogging,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn GatewayClient>,
        config: OrchestratorConfig,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator: Arc::new(ChargeOrchestrator::new(ledger.clone(), gateway.clone(), config)),
            reconciler: Arc::new(WebhookReconciler::new(ledger.clone())),
            query: QueryService::new(ledger, gateway.clone()),
            gateway,
            webhook_secret: webhook_secret.into(),
            request_logging: RequestLogging::default(),
        }
    }

    pub fn with_request_logging(mut self, logging: RequestLogging) -> Self {
        self.request_logging = logging;
        self
    }
}

pub fn create_app(state: AppState) -> Router {
    let logging = state.request_logging;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/users/:user_id/charges/card", post(handlers::charges::charge_card))
        .route("/users/:user_id/charges/banking", post(handlers::charges::charge_banking))
        .route("/tokens", post(handlers::query::create_token))
        .route("/customers", get(handlers::query::list_customers))
        .route("/customers/attach-card", post(handlers::query::attach_card))
        .route("/customers/:customer_id", get(handlers::query::get_customer))
        .route("/charges", get(handlers::query::list_charges))
        .route("/charges/:charge_id", get(handlers::query::get_charge))
        .route("/transactions/:transaction_id", get(handlers::query::get_transaction))
        .route("/ledger/transactions/:id", get(handlers::query::get_ledger_transaction))
        .route("/webhooks/gateway", post(handlers::webhook::receive))
        .layer(axum::middleware::from_fn_with_state(logging, request_logger))
        .with_state(state)
}
