use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use super::models::{
    Charge, CreateChargeRequest, CreateTokenRequest, Customer, ErrorEnvelope, GatewayTransaction,
    ListPage, Pagination, Token,
};
use crate::ports::{GatewayClient, GatewayResult};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Gateway returned {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("Invalid response from gateway: {0}")]
    InvalidResponse(String),
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
}

impl GatewayError {
    /// Whether the failure says something about gateway health rather than
    /// about the request. Only these trip the circuit breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RequestError(_)
            | GatewayError::Timeout(_)
            | GatewayError::InvalidResponse(_)
            | GatewayError::CircuitBreakerOpen(_) => true,
            GatewayError::Api { status, .. } => *status >= 500,
            GatewayError::NotFound(_) => false,
        }
    }
}

/// Whether the client is currently letting calls through to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Connection settings for [`HttpGatewayClient`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub api_url: String,
    pub vault_url: String,
    pub public_key: String,
    pub secret_key: String,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl GatewaySettings {
    pub fn new(api_url: impl Into<String>, public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            vault_url: api_url.clone(),
            api_url,
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            timeout: Duration::from_secs(30),
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

enum Credential {
    Public,
    Secret,
}

/// HTTP client for the Omise-style payment gateway REST API.
#[derive(Clone)]
pub struct HttpGatewayClient {
    client: Client,
    settings: GatewaySettings,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl HttpGatewayClient {
    pub fn new(settings: GatewaySettings) -> Self {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(settings.reset_timeout, settings.reset_timeout * 2);
        let policy = failure_policy::consecutive_failures(settings.failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        HttpGatewayClient {
            client,
            settings,
            circuit_breaker,
        }
    }

    fn request(&self, method: Method, base: &str, path: &str, credential: Credential) -> RequestBuilder {
        let url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
        let key = match credential {
            Credential::Public => &self.settings.public_key,
            Credential::Secret => &self.settings.secret_key,
        };
        self.client.request(method, url).basic_auth(key, None::<&str>)
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, &self.settings.api_url, path, Credential::Secret)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, resource: String) -> GatewayResult<T> {
        let timeout = self.settings.timeout;
        let result = self
            .circuit_breaker
            .call_with(GatewayError::is_transient as fn(&GatewayError) -> bool, async move {
                let response = request.send().await.map_err(|e| {
                    if e.is_timeout() {
                        GatewayError::Timeout(timeout)
                    } else {
                        GatewayError::RequestError(e)
                    }
                })?;
                decode::<T>(response, resource).await
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => Err(GatewayError::CircuitBreakerOpen(
                "payment gateway circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    async fn send_json<B, T>(&self, request: RequestBuilder, body: &B, resource: String) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(request.json(body), resource).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, resource: String) -> GatewayResult<T> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(resource));
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => GatewayError::Api {
                status: status.as_u16(),
                code: envelope.code,
                message: envelope.message,
            },
            Err(_) => GatewayError::Api {
                status: status.as_u16(),
                code: "unknown".to_string(),
                message: body,
            },
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::InvalidResponse(format!("{}: {}", resource, e)))
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn create_charge(&self, request: &CreateChargeRequest) -> GatewayResult<Charge> {
        self.send_json(self.api(Method::POST, "charges"), request, "charge".to_string())
            .await
    }

    async fn retrieve_charge(&self, charge_id: &str) -> GatewayResult<Charge> {
        self.send(
            self.api(Method::GET, &format!("charges/{}", charge_id)),
            format!("charge {}", charge_id),
        )
        .await
    }

    async fn list_charges(&self, page: Pagination) -> GatewayResult<ListPage<Charge>> {
        self.send(self.api(Method::GET, "charges").query(&page), "charges".to_string())
            .await
    }

    async fn retrieve_transaction(&self, transaction_id: &str) -> GatewayResult<GatewayTransaction> {
        self.send(
            self.api(Method::GET, &format!("transactions/{}", transaction_id)),
            format!("transaction {}", transaction_id),
        )
        .await
    }

    async fn create_token(&self, request: &CreateTokenRequest) -> GatewayResult<Token> {
        let builder = self.request(Method::POST, &self.settings.vault_url, "tokens", Credential::Public);
        self.send_json(builder, &serde_json::json!({ "card": request }), "token".to_string())
            .await
    }

    async fn list_customers(&self, page: Pagination) -> GatewayResult<ListPage<Customer>> {
        self.send(self.api(Method::GET, "customers").query(&page), "customers".to_string())
            .await
    }

    async fn get_customer(&self, customer_id: &str) -> GatewayResult<Customer> {
        self.send(
            self.api(Method::GET, &format!("customers/{}", customer_id)),
            format!("customer {}", customer_id),
        )
        .await
    }

    async fn attach_card(&self, customer_id: &str, card_token: &str) -> GatewayResult<Customer> {
        self.send_json(
            self.api(Method::PATCH, &format!("customers/{}", customer_id)),
            &serde_json::json!({ "card": card_token }),
            format!("customer {}", customer_id),
        )
        .await
    }

    fn circuit_state(&self) -> CircuitState {
        if self.circuit_breaker.is_call_permitted() {
            CircuitState::Closed
        } else {
            CircuitState::Open
        }
    }
}
