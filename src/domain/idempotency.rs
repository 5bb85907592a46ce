use sha2::{Digest, Sha256};
use std::fmt;

/// Key that deduplicates logically identical charge requests.
///
/// Derived from who is charged, with what instrument, for how much, plus a
/// request nonce. Two requests only collide when every part matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(user_id: &str, instrument: &str, amount: i64, currency: &str, nonce: &str) -> Self {
        let mut hasher = Sha256::new();
        let amount = amount.to_string();
        for part in [user_id, instrument, amount.as_str(), currency, nonce] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
