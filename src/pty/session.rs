use parking_lot::{Condvar, Mutex};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::pty::expect::ExpectBuffer;
use crate::pty::spawn_config::LaunchCommand;
use crate::pty::transcript::Transcript;
use crate::pty::{Console, Transport, TransportError, END_OF_STREAM};

/// How long `close` waits for the reader thread to observe EOF.
const READER_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Spawns launch commands on a native pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyTransport {
    size: PtySize,
}

impl PtyTransport {
    pub fn new() -> Self {
        Self {
            size: PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

impl Default for PtyTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for PtyTransport {
    fn spawn(
        &self,
        launch: &LaunchCommand,
        transcript: Transcript,
        cancel: CancelToken,
    ) -> Result<Box<dyn Console>, TransportError> {
        let console = PtyConsole::spawn(launch, self.size, transcript, cancel)?;
        Ok(Box::new(console))
    }
}

struct Inbox {
    buffer: Mutex<ExpectBuffer>,
    ready: Condvar,
}

/// A child process attached to a pseudo-terminal.
///
/// A reader thread drains the PTY into an [`ExpectBuffer`] and the
/// transcript; expectations block on a condition variable until the
/// literal shows up, the stream ends, the deadline passes, or the
/// cancel token fires.
pub struct PtyConsole {
    inbox: Arc<Inbox>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
    reader_handle: Option<thread::JoinHandle<()>>,
    cancel: CancelToken,
    program: String,
    closed: bool,
}

impl PtyConsole {
    pub fn spawn(
        launch: &LaunchCommand,
        size: PtySize,
        mut transcript: Transcript,
        cancel: CancelToken,
    ) -> Result<Self, TransportError> {
        let spawn_err = |e: &dyn std::fmt::Display| TransportError::Spawn {
            program: launch.program().to_string(),
            message: e.to_string(),
        };

        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size).map_err(|e| spawn_err(&e))?;

        let mut cmd = CommandBuilder::new(launch.program());
        cmd.args(launch.arguments());
        cmd.cwd(std::env::current_dir().map_err(|e| spawn_err(&e))?);
        for (key, value) in launch.environment() {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| spawn_err(&e))?;
        drop(pair.slave);
        tracing::debug!(command = %launch, "Spawned console process");

        let reader = pair.master.try_clone_reader().map_err(|e| spawn_err(&e))?;
        let writer = pair.master.take_writer().map_err(|e| spawn_err(&e))?;

        let inbox = Arc::new(Inbox {
            buffer: Mutex::new(ExpectBuffer::new()),
            ready: Condvar::new(),
        });

        let reader_inbox = Arc::clone(&inbox);
        let reader_handle = thread::Builder::new()
            .name("console-reader".to_string())
            .spawn(move || {
                let mut reader = reader;
                let mut buffer = [0u8; 8192];
                loop {
                    let count = match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(count) => count,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        // EIO once the slave side is gone.
                        Err(_) => break,
                    };
                    transcript.mirror(&buffer[..count]);
                    reader_inbox.buffer.lock().push(&buffer[..count]);
                    reader_inbox.ready.notify_all();
                }
                transcript.note("console stream ended");
                reader_inbox.buffer.lock().mark_eof();
                reader_inbox.ready.notify_all();
            })
            .map_err(|e| spawn_err(&e))?;

        Ok(Self {
            inbox,
            writer: Some(writer),
            child,
            _master: pair.master,
            reader_handle: Some(reader_handle),
            cancel,
            program: launch.program().to_string(),
            closed: false,
        })
    }

    fn wait_until<F>(&self, expected: &str, timeout: Duration, mut done: F) -> Result<(), TransportError>
    where
        F: FnMut(&mut ExpectBuffer) -> Result<bool, TransportError>,
    {
        let started = Instant::now();
        // Unrepresentable deadlines wait until match, stream end or cancel.
        let deadline = started.checked_add(timeout);
        let mut buffer = self.inbox.buffer.lock();
        loop {
            if done(&mut *buffer)? {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled {
                    expected: expected.to_string(),
                });
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout {
                            expected: expected.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            self.inbox.ready.wait_for(&mut buffer, slice);
        }
    }

    fn join_reader(&mut self) {
        let Some(handle) = self.reader_handle.take() else {
            return;
        };
        let deadline = Instant::now() + READER_JOIN_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            // Something else still holds the slave side open.
            tracing::warn!(program = %self.program, "Console reader did not finish, detaching it");
        }
    }
}

impl Console for PtyConsole {
    fn send_line(&mut self, text: &str) -> Result<(), TransportError> {
        if self.inbox.buffer.lock().is_eof() {
            return Err(TransportError::Closed);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(TransportError::Closed);
        };
        writer.write_all(text.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn expect(&mut self, literal: &str, timeout: Duration) -> Result<(), TransportError> {
        let started = Instant::now();
        self.wait_until(literal, timeout, |buffer| {
            if buffer.take_match(literal.as_bytes()) {
                return Ok(true);
            }
            if buffer.is_eof() {
                return Err(TransportError::StreamEnded {
                    expected: literal.to_string(),
                    waited: started.elapsed(),
                });
            }
            Ok(false)
        })
    }

    fn expect_eof(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.wait_until(END_OF_STREAM, timeout, |buffer| {
            let eof = buffer.is_eof();
            buffer.clear();
            Ok(eof)
        })
    }

    fn close(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.writer = None;

        let status = match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                if let Err(e) = self.child.kill() {
                    tracing::debug!(program = %self.program, "Kill failed: {}", e);
                }
                self.child.wait().ok()
            }
        };
        self.join_reader();

        status.map(|status| {
            if status.success() {
                "exit code 0".to_string()
            } else {
                format!("exit code {}", status.exit_code())
            }
        })
    }
}

impl Drop for PtyConsole {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
