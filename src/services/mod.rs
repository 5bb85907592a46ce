pub mod locks;
pub mod orchestrator;
pub mod query;
pub mod reconciler;
pub mod sweep;

pub use locks::KeyedLocks;
pub use orchestrator::{
    BankChargeRequest, CardChargeRequest, ChargeOrchestrator, ChargeReceipt, OrchestratorConfig,
};
pub use query::QueryService;
pub use reconciler::{EventWindow, ReconcileOutcome, WebhookReconciler};
pub use sweep::{run_sweeper, ReconciliationSweep, SweepReport};
