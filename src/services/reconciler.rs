//! Applies asynchronous gateway notifications to the ledger exactly once.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::locks::KeyedLocks;
use crate::domain::{ChargeStatus, Transaction, WebhookEvent};
use crate::error::AppError;
use crate::ports::{ApplyOutcome, LedgerError, LedgerStore, StatusUpdate};

pub const EVENT_WINDOW_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const EVENT_WINDOW_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied { charge_id: String, status: ChargeStatus },
    AlreadyTerminal { charge_id: String, status: ChargeStatus },
    DuplicateEvent { charge_id: String },
    /// The reported status is not final; nothing to apply yet.
    NotTerminal { charge_id: String },
}

/// Recently applied event ids. Bounded in both age and size.
pub struct EventWindow {
    ttl: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl EventWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&mut self, event_id: &str) -> bool {
        self.evict(Instant::now());
        self.seen.contains_key(event_id)
    }

    pub fn insert(&mut self, event_id: &str) {
        let now = Instant::now();
        self.evict(now);
        // The first sighting's timestamp is kept so `seen` and `order` agree.
        if self.seen.contains_key(event_id) {
            return;
        }
        self.seen.insert(event_id.to_string(), now);
        self.order.push_back((event_id.to_string(), now));
        while self.order.len() > self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }
}

impl Default for EventWindow {
    fn default() -> Self {
        Self::new(EVENT_WINDOW_TTL, EVENT_WINDOW_CAPACITY)
    }
}

pub struct WebhookReconciler {
    ledger: Arc<dyn LedgerStore>,
    locks: KeyedLocks,
    recent: Mutex<EventWindow>,
}

impl WebhookReconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self::with_window(ledger, EventWindow::default())
    }

    pub fn with_window(ledger: Arc<dyn LedgerStore>, window: EventWindow) -> Self {
        Self {
            ledger,
            locks: KeyedLocks::new(),
            recent: Mutex::new(window),
        }
    }

    /// Applies the terminal status carried by `event`, at most once per charge.
    pub async fn reconcile(&self, event: WebhookEvent) -> Result<ReconcileOutcome, AppError> {
        let charge_id = event.charge_id.clone();
        let _guard = self.locks.lock(&charge_id).await;

        let tx = match self.ledger.get_transaction(&charge_id).await {
            Ok(tx) => tx,
            Err(LedgerError::NotFound(_)) => {
                warn!(
                    charge_id = %charge_id,
                    event_id = %event.event_id,
                    "Webhook references a charge the ledger does not know"
                );
                return Err(AppError::UnknownCharge(charge_id));
            }
            Err(e) => return Err(AppError::Internal(e.to_string())),
        };

        if tx.status.is_terminal() {
            debug!(charge_id = %tx.id, status = %tx.status, "Charge already terminal, dropping event");
            return Ok(ReconcileOutcome::AlreadyTerminal {
                charge_id: tx.id,
                status: tx.status,
            });
        }
        if self.is_duplicate(&tx, &event.event_id).await {
            debug!(charge_id = %tx.id, event_id = %event.event_id, "Duplicate event, dropping");
            return Ok(ReconcileOutcome::DuplicateEvent { charge_id: tx.id });
        }

        let Some(status) = event.reported_status.terminal_status() else {
            debug!(
                charge_id = %tx.id,
                reported = ?event.reported_status,
                "Non-terminal status reported, nothing to apply"
            );
            return Ok(ReconcileOutcome::NotTerminal { charge_id: tx.id });
        };

        let update = StatusUpdate {
            status,
            failure: event.failure.clone(),
            event_id: event.event_id.clone(),
        };
        let outcome = self
            .ledger
            .apply_transition(&tx.id, update)
            .await
            .map_err(|e| {
                error!(
                    charge_id = %tx.id,
                    user_id = %tx.user_id,
                    event_id = %event.event_id,
                    "Failed to apply webhook status: {}", e
                );
                AppError::LedgerWriteFailed {
                    charge_id: tx.id.clone(),
                    user_id: tx.user_id.clone(),
                    reason: e.to_string(),
                }
            })?;

        Ok(match outcome {
            ApplyOutcome::Applied(applied) => {
                self.recent.lock().await.insert(&event.event_id);
                info!(
                    charge_id = %applied.id,
                    user_id = %applied.user_id,
                    event_id = %event.event_id,
                    status = %applied.status,
                    "Webhook status applied"
                );
                ReconcileOutcome::Applied {
                    charge_id: applied.id,
                    status: applied.status,
                }
            }
            ApplyOutcome::AlreadyTerminal(current) => ReconcileOutcome::AlreadyTerminal {
                charge_id: current.id,
                status: current.status,
            },
            ApplyOutcome::DuplicateEvent(current) => {
                ReconcileOutcome::DuplicateEvent { charge_id: current.id }
            }
        })
    }

    async fn is_duplicate(&self, tx: &Transaction, event_id: &str) -> bool {
        tx.last_event_id.as_deref() == Some(event_id) || self.recent.lock().await.contains(event_id)
    }
}
