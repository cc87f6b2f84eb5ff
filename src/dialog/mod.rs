//! Dialog Context and the transaction shortcut tables (4.6): the forwarding
//! engine's only persistent state, all keyed by Call-ID.

pub mod context;
pub mod shortcuts;

pub use context::{DialogContext, DialogState, DialogTable};
pub use shortcuts::{InviteBranchTable, PendingRequestTable};
