//! Nonce issuance and validity tracking (4.3): issue, single-use consumption,
//! and validity-window expiry, tracked in a pair of concurrent maps.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Tracks issued nonces and rejects a nonce once it is stale or has already
/// been consumed — a nonce is single-use for a given (nonce, response) pair,
/// matching the "no replay" requirement in the authentication design.
pub struct NonceTable {
    issued: DashMap<String, Instant>,
    consumed: DashMap<String, ()>,
    validity: Duration,
}

impl NonceTable {
    pub fn new(validity: Duration) -> Self {
        NonceTable {
            issued: DashMap::new(),
            consumed: DashMap::new(),
            validity,
        }
    }

    pub fn issue(&self) -> String {
        let nonce = Uuid::new_v4().simple().to_string();
        self.issued.insert(nonce.clone(), Instant::now());
        nonce
    }

    /// `Ok(())` if the nonce was issued, is still inside its validity
    /// window, and has not already been used to authenticate a request.
    pub fn check_and_consume(&self, nonce: &str) -> bool {
        let Some(issued_at) = self.issued.get(nonce).map(|e| *e) else {
            return false;
        };
        if issued_at.elapsed() > self.validity {
            self.issued.remove(nonce);
            return false;
        }
        if self.consumed.contains_key(nonce) {
            return false;
        }
        self.consumed.insert(nonce.to_string(), ());
        true
    }

    /// Periodic sweep target (4.7): drops nonces whose validity window has
    /// elapsed regardless of whether they were ever consumed.
    pub fn sweep(&self) {
        let validity = self.validity;
        self.issued.retain(|_, issued_at| issued_at.elapsed() <= validity);
        self.consumed.retain(|nonce, _| self.issued.contains_key(nonce));
    }
}
