use axum::{
    async_trait,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{error, warn};

use crate::domain::{FailureDetail, ReportedStatus, WebhookEvent};
use crate::error::AppError;
use crate::services::ReconcileOutcome;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";
const MAX_WEBHOOK_BODY: usize = 256 * 1024;

/// Request body whose `X-Gateway-Signature` matched the configured secret.
pub struct VerifiedWebhook {
    pub body: Vec<u8>,
}

impl VerifiedWebhook {
    fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> Result<(), AuthError> {
        let expected = hex::decode(signature_header.trim())
            .map_err(|_| AuthError::InvalidSignatureFormat)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AuthError::InvalidSecret)?;
        mac.update(body);

        // constant-time
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::SignatureMismatch)
    }
}

#[async_trait]
impl FromRequest<AppState> for VerifiedWebhook {
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let signature = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(AuthError::MissingSignature)?;

        let body = axum::body::to_bytes(req.into_body(), MAX_WEBHOOK_BODY)
            .await
            .map_err(|_| AuthError::BodyReadError)?
            .to_vec();

        Self::verify_signature(&state.webhook_secret, &body, &signature)?;

        Ok(VerifiedWebhook { body })
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingSignature,
    InvalidSignatureFormat,
    InvalidSecret,
    SignatureMismatch,
    BodyReadError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        warn!("Webhook authentication failed: {:?}", self);
        let error = match self {
            AuthError::MissingSignature => AppError::Unauthorized("missing X-Gateway-Signature header".to_string()),
            AuthError::InvalidSignatureFormat => AppError::Unauthorized("invalid signature format".to_string()),
            AuthError::SignatureMismatch => AppError::Unauthorized("signature verification failed".to_string()),
            AuthError::InvalidSecret => AppError::Internal("invalid webhook secret configuration".to_string()),
            AuthError::BodyReadError => AppError::InvalidRequest("failed to read request body".to_string()),
        };
        error.into_response()
    }
}

/// Event envelope posted by the gateway.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(default)]
    pub key: Option<String>,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub object: Option<String>,
    pub id: String,
    #[serde(default)]
    pub status: Option<ReportedStatus>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl WebhookEnvelope {
    /// `Ok(None)` for well-formed events about something other than a charge.
    pub fn into_event(self) -> Result<Option<WebhookEvent>, AppError> {
        if self.id.trim().is_empty() || self.data.id.trim().is_empty() {
            return Err(AppError::InvalidRequest("event and charge ids are required".to_string()));
        }
        if matches!(self.data.object.as_deref(), Some(object) if object != "charge") {
            return Ok(None);
        }
        let status = self
            .data
            .status
            .ok_or_else(|| AppError::InvalidRequest("charge status is required".to_string()))?;

        Ok(Some(
            WebhookEvent::new(self.id, self.data.id, status).with_failure(FailureDetail {
                code: self.data.failure_code,
                message: self.data.failure_message,
            }),
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub event_id: String,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
    /// Internal problem kind, reported but not retried by the gateway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<&'static str>,
}

/// Gateway notifications. Acknowledged with 200 unless the signature is
/// wrong or the payload cannot be parsed at all.
pub async fn receive(
    State(state): State<AppState>,
    webhook: VerifiedWebhook,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    let envelope: WebhookEnvelope = serde_json::from_slice(&webhook.body)
        .map_err(|e| AppError::InvalidRequest(format!("unparseable webhook payload: {}", e)))?;
    let event_id = envelope.id.clone();
    let key = envelope.key.clone().unwrap_or_default();

    let Some(event) = envelope.into_event()? else {
        return Ok((
            StatusCode::OK,
            Json(WebhookAck {
                event_id,
                acknowledged: true,
                outcome: None,
                problem: None,
            }),
        ));
    };

    let ack = match state.reconciler.reconcile(event).await {
        Ok(outcome) => WebhookAck {
            event_id,
            acknowledged: true,
            outcome: Some(outcome),
            problem: None,
        },
        Err(e) => {
            match &e {
                AppError::LedgerWriteFailed { .. } | AppError::Internal(_) => {
                    error!(event_id = %event_id, key = %key, "Webhook reconciliation failed: {}", e);
                }
                _ => {
                    warn!(event_id = %event_id, key = %key, "Webhook not applied: {}", e);
                }
            }
            WebhookAck {
                event_id,
                acknowledged: true,
                outcome: None,
                problem: Some(e.kind()),
            }
        }
    };

    Ok((StatusCode::OK, Json(ack)))
}
