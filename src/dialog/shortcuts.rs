use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Where to send the response to an outstanding request that hasn't
/// completed yet — the proxy doesn't retransmit the request itself, but it
/// still needs to remember which peer and Via branch a response must be
/// routed back to (4.5, 4.6). Keyed by Call-ID; short-lived (300s default).
#[derive(Debug, Clone)]
pub struct PendingRequestEntry {
    pub branch: String,
    pub upstream_addr: SocketAddr,
    pub downstream_addr: SocketAddr,
    pub created_at: Instant,
}

pub struct PendingRequestTable {
    entries: DashMap<String, PendingRequestEntry>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        PendingRequestTable {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, call_id: String, entry: PendingRequestEntry) {
        self.entries.insert(call_id, entry);
    }

    pub fn get(&self, call_id: &str) -> Option<PendingRequestEntry> {
        self.entries.get(call_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, call_id: &str) {
        self.entries.remove(call_id);
    }

    /// 4.7: 300s default cleanup interval.
    pub fn sweep(&self, max_age: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| now.duration_since(e.created_at) < max_age);
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The branch and target of an outstanding INVITE, kept just long enough
/// that a CANCEL for the same Call-ID can copy the INVITE's branch and reach
/// the same downstream target (4.5's CANCEL handling). Short-lived (60s
/// default) since CANCEL only ever races a ringing INVITE.
#[derive(Debug, Clone)]
pub struct InviteBranchEntry {
    pub branch: String,
    pub downstream_addr: SocketAddr,
    pub created_at: Instant,
}

pub struct InviteBranchTable {
    entries: DashMap<String, InviteBranchEntry>,
}

impl InviteBranchTable {
    pub fn new() -> Self {
        InviteBranchTable {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, call_id: String, entry: InviteBranchEntry) {
        self.entries.insert(call_id, entry);
    }

    pub fn get(&self, call_id: &str) -> Option<InviteBranchEntry> {
        self.entries.get(call_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, call_id: &str) {
        self.entries.remove(call_id);
    }

    /// 4.7: 60s default cleanup interval.
    pub fn sweep(&self, max_age: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| now.duration_since(e.created_at) < max_age);
    }
}

impl Default for InviteBranchTable {
    fn default() -> Self {
        Self::new()
    }
}
