use log::{debug, warn};
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct Shared {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Single-shot deadline timer bound to one session.
///
/// `cancel` (also run on drop) joins the timer thread, so once it returns the
/// expiry callback has either completed or will never run.
#[derive(Debug)]
pub struct Watchdog {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn arm<F>(deadline: Duration, on_expire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let timer_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                let cancelled = timer_shared
                    .cancelled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let (cancelled, _) = timer_shared
                    .wake
                    .wait_timeout_while(cancelled, deadline, |cancelled| !*cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
                if *cancelled {
                    return;
                }
                drop(cancelled);
                debug!("[watchdog] deadline of {deadline:?} expired");
                on_expire();
            })?;
        debug!("[watchdog] armed for {deadline:?}");
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Disarms the timer. Safe to call more than once.
    pub fn cancel(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        *self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            warn!("[watchdog] expiry callback panicked");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
