use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::{ChargeStatus, FailureDetail};

/// Charge status as reported by the gateway in a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Successful,
    Failed,
    Expired,
    Pending,
    Reversed,
    #[serde(other)]
    Unknown,
}

impl ReportedStatus {
    /// The terminal ledger status this report settles a charge into, if any.
    pub fn terminal_status(self) -> Option<ChargeStatus> {
        match self {
            Self::Successful => Some(ChargeStatus::Captured),
            Self::Failed => Some(ChargeStatus::Failed),
            Self::Expired => Some(ChargeStatus::Expired),
            Self::Pending | Self::Reversed | Self::Unknown => None,
        }
    }
}

/// A single status notification. Lives only as long as the dedup window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_id: String,
    pub charge_id: String,
    pub reported_status: ReportedStatus,
    pub failure: FailureDetail,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        event_id: impl Into<String>,
        charge_id: impl Into<String>,
        reported_status: ReportedStatus,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            charge_id: charge_id.into(),
            reported_status,
            failure: FailureDetail::default(),
            received_at: Utc::now(),
        }
    }

    pub fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.failure = failure;
        self
    }
}
