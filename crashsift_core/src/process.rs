use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::Child;
use thiserror::Error;

/// Teardown failures. Callers log these and move on.
#[derive(Error, Debug)]
pub enum ReapError {
    #[error("Target process id is unknown")]
    UnknownPid,
    #[error("Process {0} is already gone")]
    Gone(i32),
    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        pid: i32,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("Failed to reap backend process: {0}")]
    Io(#[from] io::Error),
}

/// Delivers signals to the supervised target by pid.
pub trait Signaller: Send + Sync {
    /// Asks the target to stop so the debugger's own stop hook still runs.
    fn interrupt(&self, pid: i32) -> Result<(), ReapError>;
    fn kill(&self, pid: i32) -> Result<(), ReapError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl NixSignaller {
    fn send(pid: i32, sig: Signal) -> Result<(), ReapError> {
        // pid 0 and negatives address process groups, never a single target.
        if pid <= 0 {
            return Err(ReapError::UnknownPid);
        }
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(ReapError::Gone(pid)),
            Err(source) => Err(ReapError::Signal {
                pid,
                signal: sig,
                source,
            }),
        }
    }
}

impl Signaller for NixSignaller {
    fn interrupt(&self, pid: i32) -> Result<(), ReapError> {
        Self::send(pid, Signal::SIGINT)
    }

    fn kill(&self, pid: i32) -> Result<(), ReapError> {
        Self::send(pid, Signal::SIGKILL)
    }
}

/// Handle on a launched debug backend.
pub trait BackendProcess: Send {
    fn id(&self) -> u32;

    /// Non-blocking check used while waiting for the backend to connect.
    fn has_exited(&mut self) -> bool;

    /// Force-kills and reaps. Must succeed quietly when already reaped.
    fn terminate(&mut self) -> Result<(), ReapError>;
}

impl BackendProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.try_wait(), Ok(Some(_)))
    }

    fn terminate(&mut self) -> Result<(), ReapError> {
        if let Err(e) = self.kill() {
            // Already exited and reaped: nothing left to kill.
            if e.kind() != io::ErrorKind::InvalidInput {
                return Err(ReapError::Io(e));
            }
        }
        self.wait()?;
        Ok(())
    }
}
