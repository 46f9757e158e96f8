use crate::backend::Backend;
use crate::hash::CrashRecord;
use crate::process::{BackendProcess, ReapError, Signaller};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transport::{SessionListener, StatusReport, TransportError};
use crate::watchdog::Watchdog;
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Set asynchronously when the operator asks the run to stop.
pub type CancelFlag = Arc<AtomicBool>;

pub const LABEL_NORMAL: &str = "NORMAL";
pub const LABEL_TIMEOUT: &str = "TIMEOUT";
pub const LABEL_UNKNOWN: &str = "UNKNOWN";
pub const LABEL_PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";

/// How the current input reaches the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    /// The command line names the current-input path itself.
    Argument,
    /// The command line has no `@@`; the file is redirected to stdin.
    Stdin(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target argument vector, already resolved against the current-input path.
    pub command: Vec<String>,
    pub port: u16,
    /// Counted from handshake completion, not from backend launch.
    pub deadline: Duration,
    pub stackframe_num: u32,
    /// How long to keep reading after the watchdog fired.
    pub grace: Duration,
    pub snapshot_wait: Duration,
    pub input_delivery: InputDelivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalStatus {
    #[default]
    Unset,
    Normal,
    Crash,
    Timeout,
    ProtocolError,
}

impl TerminalStatus {
    pub fn is_terminal(self) -> bool {
        self != TerminalStatus::Unset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Launched,
    Handshaking,
    Armed,
    Terminal,
    Reaped,
}

#[derive(Debug, Default)]
struct StatusSlot {
    status: TerminalStatus,
    settled_at: Option<Instant>,
}

/// Terminal status shared between the status read and the watchdog.
///
/// The first terminal value written sticks; later writes are rejected.
#[derive(Debug, Clone, Default)]
pub struct StatusCell {
    inner: Arc<Mutex<StatusSlot>>,
}

impl StatusCell {
    /// Returns `false` if another writer already settled the status.
    pub fn settle(&self, status: TerminalStatus) -> bool {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        slot.status = status;
        slot.settled_at = Some(Instant::now());
        true
    }

    pub fn get(&self) -> TerminalStatus {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn settled_for(&self) -> Option<Duration> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settled_at
            .map(|at| at.elapsed())
    }
}

/// Bucket an input is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    Normal,
    Timeout,
    Crash(String),
    /// Crash without a usable snapshot, empty hash, or a session that never ran.
    Unknown,
    ProtocolError,
}

impl Classification {
    pub fn from_hash(hash: String) -> Self {
        if hash.is_empty() {
            Classification::Unknown
        } else {
            Classification::Crash(hash)
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Classification::Normal => LABEL_NORMAL,
            Classification::Timeout => LABEL_TIMEOUT,
            Classification::Crash(hash) => hash,
            Classification::Unknown => LABEL_UNKNOWN,
            Classification::ProtocolError => LABEL_PROTOCOL_ERROR,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Session interrupted by operator")]
pub struct Interrupted;

/// One supervised execution of the target.
pub struct DebugSession {
    backend: Option<Box<dyn BackendProcess>>,
    target_pid: Arc<OnceLock<i32>>,
    status: StatusCell,
    snapshot: Option<Snapshot>,
    phase: SessionPhase,
    started: Instant,
    target_killed: bool,
    /// Set when the previous session's record could not be removed.
    stale_record: bool,
}

impl Default for DebugSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugSession {
    pub fn new() -> Self {
        Self {
            backend: None,
            target_pid: Arc::new(OnceLock::new()),
            status: StatusCell::default(),
            snapshot: None,
            phase: SessionPhase::Init,
            started: Instant::now(),
            target_killed: false,
            stale_record: false,
        }
    }

    pub fn status(&self) -> TerminalStatus {
        self.status.get()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn target_pid(&self) -> Option<i32> {
        self.target_pid.get().copied()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn attach(&mut self, backend: Box<dyn BackendProcess>) {
        self.backend = Some(backend);
        self.advance(SessionPhase::Launched);
    }

    fn advance(&mut self, phase: SessionPhase) {
        debug!("[session] {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn backend_exited(&mut self) -> bool {
        self.backend.as_mut().is_some_and(|b| b.has_exited())
    }

    /// Stops this session from taking a pid out of the on-disk record, which
    /// may still name the previous session's target.
    pub fn distrust_record(&mut self) {
        self.stale_record = true;
    }

    /// The record to resolve the target pid from, unless it is stale.
    fn pid_source<'a>(&self, store: &'a SnapshotStore) -> Option<&'a SnapshotStore> {
        (!self.stale_record).then_some(store)
    }

    /// Latches the pid the first time the backend has published it.
    fn resolve_target_pid(
        target_pid: &OnceLock<i32>,
        store: Option<&SnapshotStore>,
    ) -> Option<i32> {
        if let Some(pid) = target_pid.get() {
            return Some(*pid);
        }
        let pid = store?.target_pid()?;
        Some(*target_pid.get_or_init(|| pid))
    }

    /// A target pid the teardown could not confirm dead.
    pub fn unreaped_target(&self) -> Option<i32> {
        if self.status() == TerminalStatus::Normal || self.target_killed {
            return None;
        }
        self.target_pid()
    }

    /// Kills the target unless it exited normally, then kills and reaps the
    /// backend. Repeated calls do nothing.
    pub fn teardown(&mut self, signaller: &dyn Signaller, store: &SnapshotStore) {
        if self.phase == SessionPhase::Reaped {
            return;
        }
        if self.status() != TerminalStatus::Normal && !self.target_killed {
            if let Some(pid) = Self::resolve_target_pid(&self.target_pid, self.pid_source(store)) {
                match signaller.kill(pid) {
                    Ok(()) => {
                        debug!("[session] killed target {pid}");
                        self.target_killed = true;
                    }
                    Err(e @ ReapError::Gone(_)) => {
                        debug!("[session] {e}");
                        self.target_killed = true;
                    }
                    Err(e) => warn!("[session] {e}"),
                }
            }
        }
        if let Some(mut backend) = self.backend.take() {
            let id = backend.id();
            match backend.terminate() {
                Ok(()) => debug!("[session] backend {id} reaped"),
                Err(e) => warn!("[session] backend {id}: {e}"),
            }
        }
        self.advance(SessionPhase::Reaped);
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub classification: Classification,
    pub status: TerminalStatus,
    pub crash: Option<CrashRecord>,
    pub target_pid: Option<i32>,
    pub elapsed: Duration,
}

/// Runs sessions one at a time over a single listener.
pub struct SessionOrchestrator {
    config: SessionConfig,
    listener: SessionListener,
    backend: Box<dyn Backend>,
    snapshot: SnapshotStore,
    signaller: Arc<dyn Signaller>,
    cancel: CancelFlag,
    last_target_pid: Option<i32>,
}

impl SessionOrchestrator {
    pub fn new(
        config: SessionConfig,
        listener: SessionListener,
        backend: Box<dyn Backend>,
        snapshot: SnapshotStore,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        Self {
            config,
            listener,
            backend,
            snapshot,
            signaller,
            cancel: CancelFlag::default(),
            last_target_pid: None,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Replays whatever the target command currently points at.
    ///
    /// Every failure inside the session is folded into the classification;
    /// only an operator interrupt is returned as an error.
    pub fn run_session(&mut self, input: &Path) -> Result<SessionOutcome, Interrupted> {
        let mut session = DebugSession::new();
        if let Err(e) = self.snapshot.clear() {
            warn!(
                "[trace] could not remove stale snapshot {:?}: {e}; target pid will not be signalled",
                self.snapshot.path()
            );
            session.distrust_record();
        }

        let driven = self.drive(&mut session);
        session.advance(SessionPhase::Terminal);
        session.teardown(self.signaller.as_ref(), &self.snapshot);
        if let Some(pid) = session.unreaped_target() {
            self.last_target_pid = Some(pid);
        }
        driven?;

        let crash = self.collect_crash(&mut session, input);
        let classification = match session.status() {
            TerminalStatus::Normal => Classification::Normal,
            TerminalStatus::Timeout => Classification::Timeout,
            TerminalStatus::ProtocolError => Classification::ProtocolError,
            TerminalStatus::Unset => Classification::Unknown,
            TerminalStatus::Crash => crash
                .as_ref()
                .map_or(Classification::Unknown, |record| {
                    Classification::from_hash(record.hash.clone())
                }),
        };

        Ok(SessionOutcome {
            classification,
            status: session.status(),
            crash,
            target_pid: session.target_pid(),
            elapsed: session.elapsed(),
        })
    }

    /// Best-effort kill of a target an earlier teardown failed to kill.
    pub fn shutdown(&mut self) {
        debug!("[trace] shutting down orchestrator");
        let Some(pid) = self.last_target_pid.take() else {
            return;
        };
        match self.signaller.kill(pid) {
            Ok(()) => debug!("[trace] killed leftover target {pid}"),
            Err(e @ (ReapError::Gone(_) | ReapError::UnknownPid)) => debug!("[trace] {e}"),
            Err(e) => warn!("[trace] {e}"),
        }
    }

    fn drive(&mut self, session: &mut DebugSession) -> Result<(), Interrupted> {
        let process = match self.backend.launch(&self.config.command) {
            Ok(process) => process,
            Err(e) => {
                error!("[trace] {e}");
                return Ok(());
            }
        };
        debug!("[trace] backend {} launched", process.id());
        session.attach(process);

        debug!(
            "[trace] waiting for connection from backend on port {}",
            self.listener.port()
        );
        let cancel = &self.cancel;
        let accepted = self
            .listener
            .accept_session(|| stop_waiting(cancel, session, "connecting"));
        let mut channel = match accepted {
            Ok(channel) => channel,
            Err(e) => return self.fail(session, e),
        };

        session.advance(SessionPhase::Handshaking);
        if let Err(e) =
            channel.handshake(|| stop_waiting(cancel, session, "completing the handshake"))
        {
            return self.fail(session, e);
        }

        let mut watchdog = match self.arm_watchdog(session) {
            Ok(watchdog) => watchdog,
            Err(e) => return self.fail(session, TransportError::Io(e)),
        };
        session.advance(SessionPhase::Armed);

        let status = session.status.clone();
        let grace = self.config.grace;
        let read = channel
            .read_status(|| {
                if cancel.load(Ordering::SeqCst) {
                    return Err(TransportError::Cancelled);
                }
                match status.settled_for() {
                    Some(waited) if waited >= grace => Err(TransportError::Abandoned),
                    _ => Ok(()),
                }
            })
            .map(|report| {
                let observed = match &report {
                    StatusReport::Normal => TerminalStatus::Normal,
                    StatusReport::Timeout => TerminalStatus::Timeout,
                    StatusReport::Crash(payload) => {
                        debug!("[trace] crash reported: {payload:?}");
                        TerminalStatus::Crash
                    }
                };
                if !status.settle(observed) {
                    debug!(
                        "[trace] late status {observed:?} discarded, session already {:?}",
                        status.get()
                    );
                }
            });
        watchdog.cancel();

        match read {
            Ok(()) => Ok(()),
            Err(e) => self.fail(session, e),
        }
    }

    fn fail(&self, session: &DebugSession, err: TransportError) -> Result<(), Interrupted> {
        match err {
            TransportError::Cancelled => Err(Interrupted),
            TransportError::Abandoned => {
                debug!("[trace] {err}");
                Ok(())
            }
            err => {
                if session.status.settle(TerminalStatus::ProtocolError) {
                    warn!("[trace] {err}");
                } else {
                    debug!("[trace] {err} after session became {:?}", session.status());
                }
                Ok(())
            }
        }
    }

    fn arm_watchdog(&self, session: &DebugSession) -> io::Result<Watchdog> {
        let status = session.status.clone();
        let target_pid = Arc::clone(&session.target_pid);
        let snapshot = session.pid_source(&self.snapshot).cloned();
        let signaller = Arc::clone(&self.signaller);
        let deadline = self.config.deadline;
        Watchdog::arm(deadline, move || {
            if !status.settle(TerminalStatus::Timeout) {
                return;
            }
            info!("[trace] timeout detected after {deadline:?}");
            match DebugSession::resolve_target_pid(&target_pid, snapshot.as_ref()) {
                Some(pid) => match signaller.interrupt(pid) {
                    Ok(()) => debug!("[trace] interrupted target {pid}"),
                    Err(e) => warn!("[trace] {e}"),
                },
                None => warn!("[trace] target pid unknown, cannot interrupt"),
            }
        })
    }

    fn collect_crash(&self, session: &mut DebugSession, input: &Path) -> Option<CrashRecord> {
        if session.status() != TerminalStatus::Crash {
            return None;
        }
        match self.snapshot.wait_for_crash(self.config.snapshot_wait) {
            Ok(snapshot) => {
                let record = CrashRecord::from_backtrace(&snapshot.backtrace, input);
                if record.is_unknown() {
                    warn!("[trace] no frame in backtrace of {input:?} could be hashed");
                }
                session.snapshot = Some(snapshot);
                Some(record)
            }
            Err(e) => {
                warn!("[trace] crash declared for {input:?} but {e}");
                None
            }
        }
    }
}

/// Ends a wait on the backend that has no deadline of its own.
fn stop_waiting(
    cancel: &AtomicBool,
    session: &mut DebugSession,
    stage: &str,
) -> Option<TransportError> {
    if cancel.load(Ordering::SeqCst) {
        Some(TransportError::Cancelled)
    } else if session.backend_exited() {
        Some(TransportError::Protocol(format!("backend exited before {stage}")))
    } else {
        None
    }
}
