use log::debug;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// First message from the backend once it is attached to the target.
pub const HANDSHAKE_TOKEN: &[u8; 2] = b"OK";
/// Reply telling the backend to start executing the target.
pub const PROCEED_TOKEN: &[u8; 4] = b"next";
/// Upper bound of the single terminal-status read.
pub const STATUS_MAX_LEN: usize = 100;

pub const STATUS_NORMAL: &str = "normal";
pub const STATUS_TIMEOUT: &str = "timeout";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind control socket on 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Failed to accept backend connection: {0}")]
    Accept(#[source] io::Error),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Control channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Backend did not report after the session timed out")]
    Abandoned,
    #[error("Session cancelled by operator")]
    Cancelled,
}

/// What the backend reported when the target finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    Normal,
    Timeout,
    /// Any other payload; the text itself carries no further meaning.
    Crash(String),
}

impl StatusReport {
    pub fn parse(payload: &[u8]) -> Result<Self, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::Protocol("empty status payload".to_string()));
        }
        let text = std::str::from_utf8(payload).map_err(|e| {
            TransportError::Protocol(format!("status payload is not UTF-8: {e}"))
        })?;
        Ok(match text {
            STATUS_NORMAL => StatusReport::Normal,
            STATUS_TIMEOUT => StatusReport::Timeout,
            other => StatusReport::Crash(other.to_string()),
        })
    }
}

/// Loopback listener shared by every session of a run.
#[derive(Debug)]
pub struct SessionListener {
    listener: TcpListener,
    port: u16,
}

impl SessionListener {
    /// Binds `127.0.0.1:port`. The standard library enables `SO_REUSEADDR`
    /// on Unix listeners, so a port left in `TIME_WAIT` by a previous run is
    /// reusable.
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .map_err(|source| TransportError::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { port, source })?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind { port, source })?;
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for the backend to connect.
    ///
    /// There is no deadline; `abort` is polled while nothing is pending and
    /// its error ends the wait. One last accept is attempted before giving up
    /// so a connection racing the abort condition is not lost.
    pub fn accept_session<F>(&self, mut abort: F) -> Result<ControlChannel, TransportError>
    where
        F: FnMut() -> Option<TransportError>,
    {
        loop {
            if let Some(stream) = self.try_accept()? {
                return ControlChannel::new(stream);
            }
            if let Some(err) = abort() {
                return match self.try_accept()? {
                    Some(stream) => ControlChannel::new(stream),
                    None => Err(err),
                };
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn try_accept(&self) -> Result<Option<TcpStream>, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!("[transport] backend connected from {peer}");
                Ok(Some(stream))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(TransportError::Accept(e)),
        }
    }
}

/// Session-scoped duplex channel to one backend.
#[derive(Debug)]
pub struct ControlChannel {
    stream: TcpStream,
}

impl ControlChannel {
    fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(false)?;
        Ok(Self { stream })
    }

    /// Expects exactly `OK`, then answers `next`.
    ///
    /// Like [`SessionListener::accept_session`] there is no deadline; `abort`
    /// is polled while the backend stays silent and its error ends the wait.
    pub fn handshake<F>(&mut self, mut abort: F) -> Result<(), TransportError>
    where
        F: FnMut() -> Option<TransportError>,
    {
        self.stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut token = [0u8; HANDSHAKE_TOKEN.len()];
        let mut filled = 0;
        while filled < token.len() {
            match self.stream.read(&mut token[filled..]) {
                Ok(0) => {
                    return Err(TransportError::Protocol(
                        "backend closed the channel during handshake".to_string(),
                    ));
                }
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if let Some(err) = abort() {
                        return Err(err);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        if &token != HANDSHAKE_TOKEN {
            return Err(TransportError::Protocol(format!(
                "unexpected handshake token {:?}",
                String::from_utf8_lossy(&token)
            )));
        }
        self.stream.write_all(PROCEED_TOKEN)?;
        self.stream.flush()?;
        Ok(())
    }

    /// One read of up to [`STATUS_MAX_LEN`] bytes.
    ///
    /// The read wakes up periodically to call `keep_waiting`; an error from it
    /// abandons the read.
    pub fn read_status<F>(&mut self, mut keep_waiting: F) -> Result<StatusReport, TransportError>
    where
        F: FnMut() -> Result<(), TransportError>,
    {
        self.stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut buf = [0u8; STATUS_MAX_LEN];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(TransportError::Protocol(
                        "backend closed the channel without reporting".to_string(),
                    ));
                }
                Ok(n) => return StatusReport::parse(&buf[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    keep_waiting()?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}
