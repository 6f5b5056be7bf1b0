//! Helpers shared by the capture and playback threads.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Fixed-cadence scheduler with an absolute deadline.
///
/// Sleeping a fixed period after each tick drifts by the work time; this
/// schedules against `start + n * period` instead and resynchronises when the
/// thread falls more than one period behind (e.g. after a long stall).
#[derive(Debug)]
pub(crate) struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Sleep until the next deadline.
    pub(crate) fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        } else if now - self.next > self.period {
            self.next = now;
        }
        self.next += self.period;
    }
}

/// Best-effort request for elevated scheduling priority on the current thread.
///
/// Without CAP_SYS_NICE this fails; the loops still run at normal priority.
pub(crate) fn raise_thread_priority(name: &str) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: setpriority with who=0 affects only the calling thread on
        // Linux and takes no pointers.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
        if rc != 0 {
            tracing::debug!(
                thread = name,
                error = %std::io::Error::last_os_error(),
                "could not raise thread priority"
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::debug!(thread = name, "thread priority left unchanged on this platform");
    }
}

/// Joins `handle`, giving up after `timeout`.
///
/// Returns `None` when the thread panicked or is still running at the
/// deadline; a still-running thread is detached.
pub(crate) fn join_with_timeout<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
    name: &str,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(5);

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(
                thread = name,
                timeout_ms = timeout.as_millis() as u64,
                "thread did not stop in time, detaching"
            );
            return None;
        }
        thread::sleep(poll_interval);
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(panic_info) => {
            let msg = panic_info
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("unknown panic");
            tracing::error!(thread = name, "audio thread panicked: {msg}");
            None
        }
    }
}
