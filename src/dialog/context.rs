use std::net::SocketAddr;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminating,
}

/// Per-Call-ID dialog bookkeeping (3, 4.5, 4.6): enough to route in-dialog
/// requests and responses correctly without retransmitting anything itself.
#[derive(Debug, Clone)]
pub struct DialogContext {
    pub call_id: String,
    pub state: DialogState,
    pub from_tag: String,
    pub to_tag: Option<String>,
    /// Record-Route set captured from the initial INVITE's 2xx, in the
    /// order the dialog must Route requests through (4.5).
    pub route_set: Vec<String>,
    pub remote_target: Option<String>,
    pub upstream_via_addr: SocketAddr,
    pub downstream_addr: Option<SocketAddr>,
    pub last_activity: Instant,
}

impl DialogContext {
    fn can_transition(&self, target: DialogState) -> Result<()> {
        match (self.state, target) {
            (DialogState::Early, DialogState::Confirmed)
            | (DialogState::Early, DialogState::Terminating)
            | (DialogState::Confirmed, DialogState::Terminating) => Ok(()),
            (a, b) if a == b => Ok(()),
            (from, to) => Err(Error::NoRoute(format!(
                "invalid dialog transition {from:?} -> {to:?} for {}",
                self.call_id
            ))),
        }
    }

    pub fn transition(&mut self, target: DialogState) -> Result<()> {
        self.can_transition(target)?;
        if self.state != target {
            debug!(call_id = %self.call_id, from = ?self.state, to = ?target, "DIALOG state change");
        }
        self.state = target;
        self.last_activity = Instant::now();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, now: Instant, idle_timeout_secs: u64) -> bool {
        now.duration_since(self.last_activity).as_secs() >= idle_timeout_secs
    }
}

/// Call-ID → [`DialogContext`], sharded by `DashMap` so lookup, insert and
/// sweep never need to hold more than one entry lock at a time (4.6).
pub struct DialogTable {
    dialogs: DashMap<String, DialogContext>,
}

impl DialogTable {
    pub fn new() -> Self {
        DialogTable {
            dialogs: DashMap::new(),
        }
    }

    pub fn insert(&self, ctx: DialogContext) {
        self.dialogs.insert(ctx.call_id.clone(), ctx);
    }

    pub fn get(&self, call_id: &str) -> Option<DialogContext> {
        self.dialogs.get(call_id).map(|e| e.value().clone())
    }

    pub fn update<F>(&self, call_id: &str, f: F) -> Option<Result<()>>
    where
        F: FnOnce(&mut DialogContext) -> Result<()>,
    {
        self.dialogs.get_mut(call_id).map(|mut e| f(e.value_mut()))
    }

    pub fn remove(&self, call_id: &str) {
        self.dialogs.remove(call_id);
    }

    pub fn exists(&self, call_id: &str) -> bool {
        self.dialogs.contains_key(call_id)
    }

    /// Timer wheel sweep target (4.7, 3600s default): drops dialogs whose
    /// `Terminating` state has been reached, or whose last activity predates
    /// the idle timeout. Returns the Call-IDs removed for the idle-timeout
    /// reason specifically (not the `Terminating` ones, whose CDR row was
    /// already emitted on the 200 to BYE) so the caller can emit the
    /// state=FAILED/reason=Timeout CDR row the data model requires.
    pub fn sweep(&self, idle_timeout_secs: u64) -> Vec<String> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        self.dialogs.retain(|call_id, ctx| {
            if matches!(ctx.state, DialogState::Terminating) {
                return false;
            }
            if ctx.is_idle(now, idle_timeout_secs) {
                timed_out.push(call_id.clone());
                return false;
            }
            true
        });
        timed_out
    }
}

impl Default for DialogTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(call_id: &str) -> DialogContext {
        DialogContext {
            call_id: call_id.to_string(),
            state: DialogState::Early,
            from_tag: "from-tag".into(),
            to_tag: None,
            route_set: vec![],
            remote_target: None,
            upstream_via_addr: "192.0.2.1:5060".parse().unwrap(),
            downstream_addr: None,
            last_activity: Instant::now(),
        }
    }

    #[test]
    fn early_confirmed_terminating_is_a_valid_path() {
        let mut ctx = sample("call-1");
        assert!(ctx.transition(DialogState::Confirmed).is_ok());
        assert!(ctx.transition(DialogState::Terminating).is_ok());
    }

    #[test]
    fn confirmed_to_early_is_rejected() {
        let mut ctx = sample("call-1");
        ctx.transition(DialogState::Confirmed).unwrap();
        assert!(ctx.transition(DialogState::Early).is_err());
    }

    #[test]
    fn sweep_removes_terminating_and_idle_dialogs() {
        let table = DialogTable::new();
        let mut terminating = sample("call-terminating");
        terminating.state = DialogState::Terminating;
        table.insert(terminating);
        table.insert(sample("call-fresh"));

        table.sweep(3600);
        assert!(table.get("call-terminating").is_none());
        assert!(table.get("call-fresh").is_some());
    }
}
