//! Periodic comparison of gateway charge history against the ledger.
//!
//! Heals charges the gateway holds but the ledger never recorded (a
//! `LedgerWriteFailed` that nobody retried) and advances records whose
//! terminal webhook never arrived.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::orchestrator::apply_gateway_status;
use crate::domain::{FailureDetail, Transaction};
use crate::error::AppError;
use crate::gateway::models::{Charge, Pagination};
use crate::ports::{
    ApplyOutcome, GatewayClient, LedgerError, LedgerResult, LedgerStore, Reservation, StatusUpdate,
};

const PAGE_LIMIT: u32 = 100;
const CONCURRENCY: usize = 8;
/// Reservations younger than this may still have a gateway call in flight.
pub const DEFAULT_RESERVATION_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedCharge {
    pub charge_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub healed: usize,
    pub advanced: usize,
    pub unresolved: Vec<UnresolvedCharge>,
}

#[derive(Debug, Default)]
struct ChargeCheck {
    healed: bool,
    advanced: bool,
    unresolved: Option<String>,
}

enum Healing {
    Healed(Transaction),
    /// Another writer recorded the charge after the sweep looked it up.
    AlreadyRecorded(Transaction),
    Skipped(String),
}

pub struct ReconciliationSweep {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn GatewayClient>,
    reservation_grace: Duration,
}

impl ReconciliationSweep {
    pub fn new(ledger: Arc<dyn LedgerStore>, gateway: Arc<dyn GatewayClient>) -> Self {
        Self {
            ledger,
            gateway,
            reservation_grace: DEFAULT_RESERVATION_GRACE,
        }
    }

    pub fn with_reservation_grace(mut self, grace: Duration) -> Self {
        self.reservation_grace = grace;
        self
    }

    /// Walks every gateway charge page and reconciles each against the ledger.
    ///
    /// Every decision reads the ledger live; charges may be settling
    /// concurrently.
    pub async fn run(&self) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        let mut page = Some(Pagination {
            limit: PAGE_LIMIT,
            offset: 0,
        });

        while let Some(current) = page {
            let charges = self
                .gateway
                .list_charges(current)
                .await
                .map_err(AppError::from_gateway)?;
            debug!(offset = current.offset, count = charges.data.len(), "Sweeping charge page");
            page = charges.next_page();

            let checks: Vec<(String, ChargeCheck)> = stream::iter(charges.data)
                .map(|charge| async move {
                    let check = self.check_charge(&charge).await;
                    (charge.id, check)
                })
                .buffer_unordered(CONCURRENCY)
                .collect()
                .await;

            for (charge_id, check) in checks {
                report.scanned += 1;
                report.healed += usize::from(check.healed);
                report.advanced += usize::from(check.advanced);
                if let Some(reason) = check.unresolved {
                    report.unresolved.push(UnresolvedCharge { charge_id, reason });
                }
            }
        }

        report.unresolved.sort_by(|a, b| a.charge_id.cmp(&b.charge_id));
        info!(
            scanned = report.scanned,
            healed = report.healed,
            advanced = report.advanced,
            unresolved = report.unresolved.len(),
            "Reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn check_charge(&self, charge: &Charge) -> ChargeCheck {
        let mut check = ChargeCheck::default();

        let healing = match self.ledger.get_transaction(&charge.id).await {
            Ok(tx) => Ok(Healing::AlreadyRecorded(tx)),
            Err(LedgerError::NotFound(_)) => self.heal(charge).await,
            Err(e) => Err(e),
        };
        let record = match healing {
            Ok(Healing::Healed(tx)) => {
                check.healed = true;
                tx
            }
            Ok(Healing::AlreadyRecorded(tx)) => tx,
            Ok(Healing::Skipped(reason)) => {
                check.unresolved = Some(reason);
                return check;
            }
            Err(e) => {
                warn!(charge_id = %charge.id, "Could not heal unrecorded charge: {}", e);
                check.unresolved = Some(e.to_string());
                return check;
            }
        };

        if record.status.is_terminal() {
            if let Some(reported) = charge.status.terminal_status() {
                if reported != record.status {
                    warn!(
                        charge_id = %charge.id,
                        ledger_status = %record.status,
                        gateway_status = %reported,
                        "Ledger and gateway disagree on a finished charge"
                    );
                    check.unresolved = Some(format!(
                        "ledger says {}, gateway says {}",
                        record.status, reported
                    ));
                }
            }
            return check;
        }

        match self.advance(&record, charge).await {
            Ok(advanced) => check.advanced = advanced,
            Err(e) => {
                error!(
                    charge_id = %record.id,
                    user_id = %record.user_id,
                    "Failed to advance charge during sweep: {}", e
                );
                check.unresolved = Some(e.to_string());
            }
        }
        check
    }

    /// Records a gateway charge the ledger has no entry for. Never writes a
    /// second record under an idempotency key that is already held.
    async fn heal(&self, charge: &Charge) -> LedgerResult<Healing> {
        let key = charge.metadata_idempotency_key();

        if let Some(key) = key {
            if let Some(holder) = self.ledger.find_by_idempotency_key(key).await? {
                return self.adopt(charge, holder).await;
            }
        }

        let Some(user_id) = charge.metadata_user_id() else {
            return Ok(Healing::Skipped("charge carries no user".to_string()));
        };
        match self.ledger.get_user(user_id).await {
            Ok(_) => {}
            Err(LedgerError::NotFound(_)) => {
                return Ok(Healing::Skipped(format!("user {} is not in the ledger", user_id)));
            }
            Err(e) => return Err(e),
        }

        let key = key
            .map(str::to_string)
            .unwrap_or_else(|| format!("gateway:{}", charge.id));
        let mut tx = Transaction::reserve(user_id, charge.amount, &charge.currency, charge.method(), key);
        tx.id = charge.id.clone();
        if let Some(created_at) = charge.created_at {
            tx.created_at = created_at;
        }
        apply_gateway_status(&mut tx, charge);

        match self.ledger.reserve_transaction(tx).await? {
            Reservation::Created(recorded) => {
                self.ledger
                    .append_user_transaction(&recorded.user_id, &recorded.id)
                    .await?;
                info!(charge_id = %recorded.id, user_id = %recorded.user_id, "Recorded unrecorded charge");
                Ok(Healing::Healed(recorded))
            }
            Reservation::Existing(holder) => self.adopt(charge, holder).await,
        }
    }

    /// Resolves a charge against the record already holding its idempotency key.
    async fn adopt(&self, charge: &Charge, holder: Transaction) -> LedgerResult<Healing> {
        if holder.id == charge.id {
            return Ok(Healing::AlreadyRecorded(holder));
        }
        if !holder.is_reservation() {
            return Ok(Healing::Skipped(format!(
                "idempotency key already settled as {}",
                holder.id
            )));
        }
        let age = Utc::now().signed_duration_since(holder.created_at);
        if age.to_std().unwrap_or_default() < self.reservation_grace {
            return Ok(Healing::Skipped("reservation still in flight".to_string()));
        }

        let mut tx = holder.clone();
        tx.id = charge.id.clone();
        apply_gateway_status(&mut tx, charge);
        let settled = self.ledger.settle_reservation(&holder.reference, tx).await?;
        self.ledger
            .append_user_transaction(&settled.user_id, &settled.id)
            .await?;
        info!(charge_id = %settled.id, user_id = %settled.user_id, "Settled orphaned reservation");
        Ok(Healing::Healed(settled))
    }

    async fn advance(&self, record: &Transaction, charge: &Charge) -> LedgerResult<bool> {
        let Some(status) = charge.status.terminal_status() else {
            return Ok(false);
        };
        let update = StatusUpdate {
            status,
            failure: FailureDetail {
                code: charge.failure_code.clone(),
                message: charge.failure_message.clone(),
            },
            event_id: format!("sweep:{}:{}", charge.id, status),
        };

        match self.ledger.apply_transition(&record.id, update).await? {
            ApplyOutcome::Applied(tx) => {
                info!(charge_id = %tx.id, status = %tx.status, "Advanced charge from gateway history");
                Ok(true)
            }
            ApplyOutcome::AlreadyTerminal(_) | ApplyOutcome::DuplicateEvent(_) => Ok(false),
        }
    }
}

/// Runs the sweep forever, once per `every`.
pub async fn run_sweeper(sweep: Arc<ReconciliationSweep>, every: Duration) {
    info!(interval_secs = every.as_secs(), "Reconciliation sweeper started");

    loop {
        sleep(every).await;

        if let Err(e) = sweep.run().await {
            error!("Reconciliation sweep error: {}", e);
        }
    }
}
