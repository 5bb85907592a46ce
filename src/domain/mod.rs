//! Core domain types, free of transport and storage concerns.

pub mod idempotency;
pub mod transaction;
pub mod user;
pub mod webhook;

pub use idempotency::IdempotencyKey;
pub use transaction::{ChargeMethod, ChargeStatus, FailureDetail, Transaction, Transition};
pub use user::User;
pub use webhook::{ReportedStatus, WebhookEvent};
