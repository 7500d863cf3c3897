pub mod editing;
pub mod ledger;
pub mod registry;

pub use editing::{
    Checkpoint, CodeEditingSession, Exchange, ExchangeState, RollbackReport, SessionEvent,
    SessionState,
};
pub use registry::{SessionEntry, SessionRegistry, StopHandle};
