//! The timer wheel (4.7): one periodic tick sweeping every table that holds
//! time-bounded state. A generic delay-queue shape is unnecessary here —
//! each table already knows how to sweep itself by
//! `last_activity`/`created_at`, so the wheel is just the
//! `tokio::time::interval` driving those sweeps together.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::auth::NonceTable;
use crate::cdr::{CallResult, CdrRecorder};
use crate::dialog::{DialogTable, InviteBranchTable, PendingRequestTable};
use crate::registrar::Registrar;

pub const DIALOG_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
pub const PENDING_CLEANUP: Duration = Duration::from_secs(300);
pub const BRANCH_CLEANUP: Duration = Duration::from_secs(60);
pub const CDR_TOMBSTONE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Everything the periodic sweep needs a handle to.
pub struct TimerWheel {
    pub registrar: Arc<Registrar>,
    pub dialogs: Arc<DialogTable>,
    pub pending: Arc<PendingRequestTable>,
    pub invite_branches: Arc<InviteBranchTable>,
    pub cdr: Arc<CdrRecorder>,
    pub nonces: Arc<NonceTable>,
    pub tick: Duration,
}

impl TimerWheel {
    pub fn sweep_once(&self) {
        let now = std::time::Instant::now();
        self.registrar.sweep(now);

        // Idle-timeout dialogs (4.7): emit the state=FAILED/reason=Timeout
        // row the data model requires, then let `flush` tombstone it so the
        // call-id's own retransmitted teardown can't double-write.
        for call_id in self.dialogs.sweep(DIALOG_IDLE_TIMEOUT.as_secs()) {
            debug!(%call_id, "TIMER-DIALOG idle timeout");
            self.cdr.set_result(&call_id, CallResult::Failed);
            self.cdr.set_reason(&call_id, "Timeout");
            let _ = self.cdr.flush(&[call_id]);
        }

        self.pending.sweep(PENDING_CLEANUP);
        self.invite_branches.sweep(BRANCH_CLEANUP);
        self.cdr.sweep_flushed(CDR_TOMBSTONE_TTL);
        self.nonces.sweep();
        debug!("TIMER-SWEEP completed");
    }

    /// Runs the sweep loop until the process shuts down. Spawned as its own
    /// task so a slow sweep never blocks the receive loop (5).
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            interval.tick().await;
            self.sweep_once();
        }
    }
}
