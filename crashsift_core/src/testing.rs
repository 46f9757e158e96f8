//! In-process stand-ins for the debugger backend and signal delivery.

use crate::backend::{Backend, BackendError};
use crate::process::{BackendProcess, ReapError, Signaller};
use crate::snapshot::{Snapshot, SnapshotStore, TargetRecord};
use crate::transport::{HANDSHAKE_TOKEN, PROCEED_TOKEN};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const FAKE_PID_BASE: u32 = 900_000;
const POLL: Duration = Duration::from_millis(10);
const MAX_LINGER: Duration = Duration::from_secs(30);

/// How a fake backend behaves once launched.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Handshake, publish the record, send `status`.
    Report {
        status: &'static str,
        backtrace: Option<&'static str>,
        target_pid: Option<i32>,
    },
    /// Send a wrong 2-byte token instead of `OK`.
    BadHandshake(&'static [u8; 2]),
    /// Connect, never send anything, exit after `linger`.
    Silent { linger: Duration },
    /// Handshake, publish the pid, never report.
    Hang { target_pid: Option<i32> },
    /// Handshake, publish the pid, report after `delay`.
    LateReport {
        delay: Duration,
        status: &'static str,
        target_pid: Option<i32>,
    },
    /// Exit without ever connecting.
    Exit,
    /// The launch itself fails.
    LaunchFailure,
}

impl Script {
    pub(crate) fn report(status: &'static str) -> Self {
        Script::Report {
            status,
            backtrace: None,
            target_pid: None,
        }
    }

    pub(crate) fn crash(backtrace: &'static str, target_pid: i32) -> Self {
        Script::Report {
            status: "crash",
            backtrace: Some(backtrace),
            target_pid: Some(target_pid),
        }
    }
}

type Chooser = Box<dyn FnMut(&[String]) -> Script + Send>;

pub(crate) struct FakeBackend {
    port: u16,
    snapshot: SnapshotStore,
    chooser: Chooser,
    launches: u32,
    terminations: Arc<AtomicUsize>,
}

impl FakeBackend {
    /// `chooser` sees the target command of each launch.
    pub(crate) fn new<F>(port: u16, snapshot: SnapshotStore, chooser: F) -> Self
    where
        F: FnMut(&[String]) -> Script + Send + 'static,
    {
        Self {
            port,
            snapshot,
            chooser: Box::new(chooser),
            launches: 0,
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn scripted(port: u16, snapshot: SnapshotStore, script: Script) -> Self {
        Self::new(port, snapshot, move |_| script.clone())
    }

    /// Total `terminate` calls across every launched process.
    pub(crate) fn terminations(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.terminations)
    }
}

impl Backend for FakeBackend {
    fn launch(&mut self, command: &[String]) -> Result<Box<dyn BackendProcess>, BackendError> {
        let script = (self.chooser)(command);
        if let Script::LaunchFailure = script {
            return Err(BackendError::Launch {
                debugger: PathBuf::from("fake-debugger"),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted launch failure"),
            });
        }

        self.launches += 1;
        let killed = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (port, snapshot) = (self.port, self.snapshot.clone());
        let (thread_killed, thread_finished) = (Arc::clone(&killed), Arc::clone(&finished));
        thread::spawn(move || {
            play(port, &snapshot, script, &thread_killed);
            thread_finished.store(true, Ordering::SeqCst);
        });

        Ok(Box::new(FakeProcess {
            id: FAKE_PID_BASE + self.launches,
            killed,
            finished,
            terminations: Arc::clone(&self.terminations),
        }))
    }
}

struct FakeProcess {
    id: u32,
    killed: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    terminations: Arc<AtomicUsize>,
}

impl BackendProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn has_exited(&mut self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) -> Result<(), ReapError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn linger(killed: &AtomicBool, limit: Duration) {
    let started = Instant::now();
    while !killed.load(Ordering::SeqCst) && started.elapsed() < limit {
        thread::sleep(POLL);
    }
}

fn publish(snapshot: &SnapshotStore, target_pid: Option<i32>, backtrace: Option<&str>) {
    let record = TargetRecord {
        target_pid,
        crash: backtrace.map(|bt| Snapshot {
            register_info: "rip            0x401136            0x401136 <main+16>\n".to_string(),
            backtrace: bt.to_string(),
        }),
    };
    // Tests that block the record path expect the write to be lost.
    let _ = snapshot.write(&record);
}

/// Waits for `next` while honouring `killed`.
fn await_proceed(stream: &mut TcpStream, killed: &AtomicBool) -> bool {
    if stream.set_read_timeout(Some(POLL)).is_err() {
        return false;
    }
    let mut reply = [0u8; PROCEED_TOKEN.len()];
    let mut filled = 0;
    while filled < reply.len() {
        if killed.load(Ordering::SeqCst) {
            return false;
        }
        match stream.read(&mut reply[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(_) => return false,
        }
    }
    &reply == PROCEED_TOKEN
}

fn play(port: u16, snapshot: &SnapshotStore, script: Script, killed: &AtomicBool) {
    if let Script::Exit | Script::LaunchFailure = script {
        return;
    }
    let Ok(mut stream) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)) else {
        return;
    };
    match script {
        Script::BadHandshake(token) => {
            let _ = stream.write_all(token);
            linger(killed, MAX_LINGER);
            return;
        }
        Script::Silent { linger: limit } => {
            linger(killed, limit);
            return;
        }
        _ => {}
    }
    if stream.write_all(HANDSHAKE_TOKEN).is_err() || !await_proceed(&mut stream, killed) {
        return;
    }
    match script {
        Script::Report {
            status,
            backtrace,
            target_pid,
        } => {
            publish(snapshot, target_pid, backtrace);
            let _ = stream.write_all(status.as_bytes());
        }
        Script::Hang { target_pid } => {
            publish(snapshot, target_pid, None);
            linger(killed, MAX_LINGER);
        }
        Script::LateReport {
            delay,
            status,
            target_pid,
        } => {
            publish(snapshot, target_pid, None);
            linger(killed, delay);
            let _ = stream.write_all(status.as_bytes());
        }
        Script::Exit | Script::LaunchFailure | Script::BadHandshake(_) | Script::Silent { .. } => {}
    }
}

/// Records signals instead of delivering them.
#[derive(Debug, Default)]
pub(crate) struct RecordingSignaller {
    interrupts: Mutex<Vec<i32>>,
    kills: Mutex<Vec<i32>>,
}

impl RecordingSignaller {
    pub(crate) fn interrupts(&self) -> Vec<i32> {
        self.interrupts.lock().unwrap().clone()
    }

    pub(crate) fn kills(&self) -> Vec<i32> {
        self.kills.lock().unwrap().clone()
    }
}

impl Signaller for RecordingSignaller {
    fn interrupt(&self, pid: i32) -> Result<(), ReapError> {
        self.interrupts.lock().unwrap().push(pid);
        Ok(())
    }

    fn kill(&self, pid: i32) -> Result<(), ReapError> {
        self.kills.lock().unwrap().push(pid);
        Ok(())
    }
}
