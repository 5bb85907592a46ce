//! Transaction domain entity.
//! Framework-agnostic representation of a charge recorded against a user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a charge.
///
/// ```text
/// Pending ──► Captured | Failed                          (card path)
/// Pending ──► AwaitingAuthorization ──► Captured | Failed | Expired   (bank path)
/// ```
///
/// Terminal states never move again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Pending,
    AwaitingAuthorization,
    Captured,
    Failed,
    Expired,
}

impl ChargeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Captured | Self::Failed | Self::Expired)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::AwaitingAuthorization => 1,
            Self::Captured | Self::Failed | Self::Expired => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_transition_to(self, next: ChargeStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingAuthorization => "awaiting_authorization",
            Self::Captured => "captured",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "awaiting_authorization" => Some(Self::AwaitingAuthorization),
            "captured" => Some(Self::Captured),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMethod {
    Card,
    Banking,
}

impl ChargeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Banking => "banking",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "card" => Some(Self::Card),
            "banking" => Some(Self::Banking),
            _ => None,
        }
    }
}

/// Result of asking a transaction to move to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

/// Terminal failure details reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureDetail {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Domain entity representing a charge recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Gateway charge id once known, the local reservation reference before that.
    pub id: String,
    /// Local reservation id, fixed at reservation time.
    pub reference: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub method: ChargeMethod,
    pub status: ChargeStatus,
    pub idempotency_key: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub last_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Builds a `Pending` reservation that has not been sent to the gateway yet.
    pub fn reserve(
        user_id: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
        method: ChargeMethod,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let reference = format!("rsv_{}", Uuid::new_v4().simple());
        Self {
            id: reference.clone(),
            reference,
            user_id: user_id.into(),
            amount,
            currency: currency.into(),
            method,
            status: ChargeStatus::Pending,
            idempotency_key: idempotency_key.into(),
            failure_code: None,
            failure_message: None,
            last_event_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record is still an unsent reservation.
    pub fn is_reservation(&self) -> bool {
        self.id == self.reference
    }

    /// Moves the transaction forward. Backward moves and moves out of a
    /// terminal state leave it untouched.
    pub fn transition(&mut self, next: ChargeStatus) -> Transition {
        if !self.status.can_transition_to(next) {
            return Transition::Ignored;
        }
        self.status = next;
        self.updated_at = Utc::now();
        Transition::Applied
    }

    /// Moves to `Failed` and records why. Failure fields are only written
    /// when the transition itself applies.
    pub fn fail(&mut self, failure: FailureDetail) -> Transition {
        let outcome = self.transition(ChargeStatus::Failed);
        if outcome == Transition::Applied {
            self.failure_code = failure.code;
            self.failure_message = failure.message;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Transaction {
        Transaction::reserve("42", 1000, "thb", ChargeMethod::Card, "key")
    }

    #[test]
    fn test_reservation_starts_pending_with_local_reference() {
        let tx = pending();
        assert_eq!(tx.status, ChargeStatus::Pending);
        assert!(tx.id.starts_with("rsv_"));
        assert!(tx.is_reservation());
    }

    #[test]
    fn test_forward_transitions_apply() {
        let mut tx = pending();
        assert_eq!(tx.transition(ChargeStatus::AwaitingAuthorization), Transition::Applied);
        assert_eq!(tx.transition(ChargeStatus::Expired), Transition::Applied);
        assert_eq!(tx.status, ChargeStatus::Expired);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut tx = pending();
        tx.transition(ChargeStatus::Captured);

        assert_eq!(tx.transition(ChargeStatus::Failed), Transition::Ignored);
        assert_eq!(tx.transition(ChargeStatus::Pending), Transition::Ignored);
        assert_eq!(tx.status, ChargeStatus::Captured);
    }

    #[test]
    fn test_backward_transition_ignored() {
        let mut tx = pending();
        tx.transition(ChargeStatus::AwaitingAuthorization);
        assert_eq!(tx.transition(ChargeStatus::Pending), Transition::Ignored);
        assert_eq!(tx.status, ChargeStatus::AwaitingAuthorization);
    }

    #[test]
    fn test_fail_after_capture_keeps_failure_fields_empty() {
        let mut tx = pending();
        tx.transition(ChargeStatus::Captured);
        let outcome = tx.fail(FailureDetail {
            code: Some("insufficient_fund".to_string()),
            message: None,
        });
        assert_eq!(outcome, Transition::Ignored);
        assert!(tx.failure_code.is_none());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            ChargeStatus::Pending,
            ChargeStatus::AwaitingAuthorization,
            ChargeStatus::Captured,
            ChargeStatus::Failed,
            ChargeStatus::Expired,
        ] {
            assert_eq!(ChargeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ChargeStatus::parse("reversed"), None);
    }
}
