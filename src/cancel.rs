use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Granularity of cancellable waits.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `now + duration`, or `None` when that instant is not representable.
pub fn deadline_after(duration: Duration) -> Option<Instant> {
    Instant::now().checked_add(duration)
}

/// Returned by waits that observed cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Shared cancellation flag for provisioning runs.
///
/// Cloned into every session of a process; signal handlers flip the
/// same flag so every blocking wait notices within [`POLL_INTERVAL`].
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    /// Instances spawned and not yet cleaned up, for the forced-exit log.
    live: Arc<Mutex<Vec<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` on the first call only.
    pub fn cancel(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::SeqCst);
        if first {
            tracing::warn!("Cancellation requested, sessions will clean up and stop");
        }
        first
    }

    /// Remember a running instance until its session cleans it up.
    pub fn track(&self, instance: &str) {
        self.live.lock().push(instance.to_string());
    }

    pub fn untrack(&self, instance: &str) {
        self.live.lock().retain(|live| live != instance);
    }

    pub fn live_instances(&self) -> Vec<String> {
        self.live.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if the token is cancelled.
    ///
    /// A duration too large to represent as a deadline sleeps until
    /// cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = deadline_after(duration);
        loop {
            self.check()?;
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            std::thread::sleep(slice);
        }
    }

    /// Route SIGINT and SIGTERM to this token.
    ///
    /// A second SIGINT terminates the process immediately with 130, for
    /// when cleanup itself hangs. Instances still running at that point
    /// are logged so they can be stopped by hand.
    #[cfg(unix)]
    pub fn register_signals(&self) -> io::Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        signal_hook::flag::register(SIGINT, Arc::clone(&self.flag))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.flag))?;

        let mut signals = Signals::new([SIGINT])?;
        let token = self.clone();
        std::thread::Builder::new()
            .name("signal-watch".to_string())
            .spawn(move || {
                for (count, _) in signals.forever().enumerate() {
                    if count == 0 {
                        tracing::warn!("Interrupted, cleaning up; interrupt again to exit without cleanup");
                        continue;
                    }
                    token.exit_without_cleanup();
                }
            })?;
        Ok(())
    }

    #[cfg(unix)]
    fn exit_without_cleanup(&self) -> ! {
        let live = self.live_instances();
        if live.is_empty() {
            tracing::error!("Interrupted twice, exiting without cleanup");
        } else {
            tracing::error!(
                instances = %live.join(" "),
                "Interrupted twice, exiting without cleanup; stop the instances by hand (e.g. `docker stop {}`)",
                live.join(" ")
            );
        }
        std::process::exit(130)
    }

    #[cfg(not(unix))]
    pub fn register_signals(&self) -> io::Result<()> {
        Ok(())
    }
}
