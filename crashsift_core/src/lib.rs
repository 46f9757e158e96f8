pub mod backend;
pub mod config;
pub mod hash;
pub mod process;
pub mod runner;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendError, GdbBackend};
pub use config::{ConfigError, TriageConfig};
pub use hash::{CrashRecord, crash_hash};
pub use process::{BackendProcess, NixSignaller, ReapError, Signaller};
pub use runner::{CorpusRunner, RunSummary, RunnerError};
pub use session::{
    CancelFlag, Classification, DebugSession, InputDelivery, Interrupted, SessionConfig,
    SessionOrchestrator, SessionOutcome, TerminalStatus,
};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore};
pub use transport::{SessionListener, StatusReport, TransportError};
pub use watchdog::Watchdog;
