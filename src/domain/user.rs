use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account holder owning an ordered list of transaction ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Insertion order is chronological.
    pub transactions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transactions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Appends `tx_id` unless it is already present. Returns whether the
    /// collection changed.
    pub fn append_transaction(&mut self, tx_id: &str) -> bool {
        if self.owns(tx_id) {
            return false;
        }
        self.transactions.push(tx_id.to_string());
        true
    }

    pub fn owns(&self, tx_id: &str) -> bool {
        self.transactions.iter().any(|id| id == tx_id)
    }
}
