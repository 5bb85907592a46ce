pub mod in_memory_ledger;
pub mod postgres_ledger;

pub use in_memory_ledger::InMemoryLedgerStore;
pub use postgres_ledger::PostgresLedgerStore;
