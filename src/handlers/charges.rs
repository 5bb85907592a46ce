use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::{ChargeMethod, ChargeStatus};
use crate::error::AppError;
use crate::services::{BankChargeRequest, CardChargeRequest, ChargeReceipt};
use crate::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct CardChargeBody {
    pub token: String,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BankChargeBody {
    pub source: String,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChargeResponse {
    pub id: String,
    pub reference: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub method: ChargeMethod,
    pub status: ChargeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_uri: Option<String>,
    pub replayed: bool,
}

impl From<ChargeReceipt> for ChargeResponse {
    fn from(receipt: ChargeReceipt) -> Self {
        let tx = receipt.transaction;
        Self {
            id: tx.id,
            reference: tx.reference,
            user_id: tx.user_id,
            amount: tx.amount,
            currency: tx.currency,
            method: tx.method,
            status: tx.status,
            authorize_uri: receipt.authorize_uri,
            replayed: receipt.replayed,
        }
    }
}

fn nonce(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim().to_string()))
            .map_err(|_| AppError::InvalidRequest("Idempotency-Key must be visible ASCII".to_string())),
    }
}

fn respond(receipt: ChargeReceipt) -> (StatusCode, Json<ChargeResponse>) {
    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(ChargeResponse::from(receipt)))
}

pub async fn charge_card(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CardChargeBody>,
) -> Result<(StatusCode, Json<ChargeResponse>), AppError> {
    let receipt = state
        .orchestrator
        .charge_card(CardChargeRequest {
            amount: body.amount,
            currency: body.currency,
            card_token: body.token,
            user_id,
            nonce: nonce(&headers)?,
        })
        .await?;
    Ok(respond(receipt))
}

pub async fn charge_banking(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BankChargeBody>,
) -> Result<(StatusCode, Json<ChargeResponse>), AppError> {
    let receipt = state
        .orchestrator
        .charge_banking(BankChargeRequest {
            amount: body.amount,
            currency: body.currency,
            source: body.source,
            user_id,
            nonce: nonce(&headers)?,
        })
        .await?;
    Ok(respond(receipt))
}
