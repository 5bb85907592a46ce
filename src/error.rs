use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::ports::LedgerError;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Unknown charge: {0}")]
    UnknownCharge(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Charge {charge_id} declined: {}", .message.as_deref().unwrap_or("no reason given"))]
    GatewayDeclined {
        charge_id: String,
        code: Option<String>,
        message: Option<String>,
    },

    /// The gateway holds a charge that the ledger failed to record.
    #[error("Ledger write failed for charge {charge_id} (user {user_id}): {reason}")]
    LedgerWriteFailed {
        charge_id: String,
        user_id: String,
        reason: String,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UserNotFound(_) | AppError::UnknownCharge(_) | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::GatewayDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::LedgerWriteFailed { .. } | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::UserNotFound(_) => "user_not_found",
            AppError::UnknownCharge(_) => "unknown_charge",
            AppError::NotFound(_) => "not_found",
            AppError::GatewayUnavailable(_) => "gateway_unavailable",
            AppError::GatewayDeclined { .. } => "gateway_declined",
            AppError::LedgerWriteFailed { .. } => "ledger_write_failed",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may resend the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::GatewayUnavailable(_))
    }

    /// Maps a read-only gateway failure. Writes go through the orchestrator,
    /// which classifies failures itself.
    pub fn from_gateway(e: GatewayError) -> Self {
        match e {
            GatewayError::NotFound(what) => AppError::NotFound(what),
            other => AppError::GatewayUnavailable(other.to_string()),
        }
    }

    /// Maps a ledger failure that happened before any gateway side effect.
    pub fn from_ledger_read(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::InvalidRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "status": status.as_u16(),
        });

        match &self {
            AppError::GatewayDeclined {
                charge_id,
                code,
                message,
            } => {
                body["charge_id"] = json!(charge_id);
                body["failure_code"] = json!(code);
                body["failure_message"] = json!(message);
            }
            AppError::LedgerWriteFailed { charge_id, .. } => {
                body["charge_id"] = json!(charge_id);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_status_code() {
        let error = AppError::InvalidRequest("amount must be positive".to_string());
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_family_status_code() {
        assert_eq!(
            AppError::UserNotFound("1".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::UnknownCharge("chrg_x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_ledger_write_failed_is_distinct_from_decline() {
        let ledger = AppError::LedgerWriteFailed {
            charge_id: "chrg_1".to_string(),
            user_id: "1".to_string(),
            reason: "disk full".to_string(),
        };
        let declined = AppError::GatewayDeclined {
            charge_id: "chrg_1".to_string(),
            code: Some("insufficient_fund".to_string()),
            message: None,
        };
        assert_ne!(ledger.kind(), declined.kind());
        assert_eq!(ledger.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(declined.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_only_gateway_unavailable_is_retryable() {
        assert!(AppError::GatewayUnavailable("timeout".to_string()).is_retryable());
        assert!(!AppError::InvalidRequest("x".to_string()).is_retryable());
    }

    #[test]
    fn test_gateway_not_found_maps_to_not_found() {
        let error = AppError::from_gateway(GatewayError::NotFound("charge chrg_x".to_string()));
        assert!(matches!(error, AppError::NotFound(_)));

        let error = AppError::from_gateway(GatewayError::CircuitBreakerOpen("open".to_string()));
        assert!(matches!(error, AppError::GatewayUnavailable(_)));
    }

    #[tokio::test]
    async fn test_declined_response() {
        let error = AppError::GatewayDeclined {
            charge_id: "chrg_1".to_string(),
            code: Some("insufficient_fund".to_string()),
            message: Some("insufficient funds".to_string()),
        };
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_unauthorized_response() {
        let response = AppError::Unauthorized("bad signature".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
