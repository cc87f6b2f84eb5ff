//! REGISTER handling and the Contact Binding table (4.4).

use std::net::SocketAddr;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::Config;
use crate::message::AddrHeaderValue;

pub type Aor = String;

/// One registered Contact for an AOR, NAT-corrected at registration time.
#[derive(Debug, Clone)]
pub struct ContactBinding {
    pub contact_uri: String,
    pub received_addr: SocketAddr,
    pub expires_at: Instant,
    pub registered_at: Instant,
    pub call_id: String,
    pub cseq: u32,
}

impl ContactBinding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// No two bindings may share both contact URI and real source endpoint
    /// (3, Contact Binding invariant).
    fn same_identity(&self, contact_uri: &str, received_addr: SocketAddr) -> bool {
        self.contact_uri == contact_uri && self.received_addr == received_addr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Success,
    Unregistered,
}

pub struct RegisterResult {
    pub outcome: RegisterOutcome,
    pub remaining: Vec<ContactBinding>,
}

/// Concurrent AOR → bindings table. Every operation that needs to observe
/// and then mutate a single AOR's binding list does so under one
/// `DashMap` entry lock rather than taking the whole table lock, per the
/// "no operation holds more than one lock" rule (4.6).
pub struct Registrar {
    bindings: DashMap<Aor, Vec<ContactBinding>>,
}

impl Registrar {
    pub fn new() -> Self {
        Registrar {
            bindings: DashMap::new(),
        }
    }

    /// Applies one REGISTER's Contact list to `aor`'s binding set (4.4):
    /// `Expires: 0` (or a zero per-Contact `expires` param) removes that
    /// binding; otherwise the binding is upserted with
    /// `min(requested, policy-max, 3600s)`.
    pub fn register(
        &self,
        config: &Config,
        aor: Aor,
        contacts: &[AddrHeaderValue],
        default_expires: u32,
        received_addr: SocketAddr,
        call_id: String,
        cseq: u32,
    ) -> RegisterResult {
        let now = Instant::now();
        let policy_max = config.registration_max_expires();
        let key = aor.clone();
        let remaining = {
            let mut entry = self.bindings.entry(aor).or_default();

            for contact in contacts {
                let contact_uri = contact.uri.to_string();
                let requested = contact.expires().unwrap_or(default_expires);

                entry.retain(|b| !b.same_identity(&contact_uri, received_addr));

                if requested == 0 {
                    debug!(%contact_uri, "registrar: removing binding");
                    continue;
                }

                let effective = requested.min(policy_max).min(3600);
                entry.push(ContactBinding {
                    contact_uri,
                    received_addr,
                    expires_at: now + std::time::Duration::from_secs(effective as u64),
                    registered_at: now,
                    call_id: call_id.clone(),
                    cseq,
                });
            }

            entry.retain(|b| !b.is_expired(now));
            entry.clone()
        };

        let outcome = if remaining.is_empty() {
            self.bindings.remove(&key);
            RegisterOutcome::Unregistered
        } else {
            RegisterOutcome::Success
        };
        info!(bindings = remaining.len(), ?outcome, "REGISTER processed");
        RegisterResult { outcome, remaining }
    }

    pub fn lookup(&self, aor: &str) -> Vec<ContactBinding> {
        self.bindings
            .get(aor)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Timer wheel sweep target (4.7): evicts expired bindings and drops any
    /// AOR left with an empty binding list.
    pub fn sweep(&self, now: Instant) {
        self.bindings.retain(|_, bindings| {
            bindings.retain(|b| !b.is_expired(now));
            !bindings.is_empty()
        });
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}
