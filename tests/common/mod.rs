//! Shared test utilities: a scripted console, a transport that hands it
//! out, and a runtime that counts what cleanup asks of it.

#![allow(dead_code, unused_imports)]

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use pibake::cancel::CancelToken;
use pibake::config::Config;
use pibake::pty::{Console, LaunchCommand, Transcript, Transport, TransportError};
use pibake::runtime::{ResourceId, Runtime, RuntimeError};
use pibake::session::Provisioner;

/// Everything the driver did to the console, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Sent(String),
    Expected(String),
    ExpectedEof,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Timed {
    pub event: Event,
    pub at: Instant,
}

/// How an expectation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Timeout,
    StreamEnded,
    Cancel,
}

/// Rules the scripted console follows. Expectations succeed at once
/// unless a rule says otherwise.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Fail the expectation that follows sending this exact line.
    pub fail_after_send: Option<(String, Failure)>,
    /// Fail any expectation of this literal.
    pub fail_expect: Option<(String, Failure)>,
    /// Fail the end-of-stream wait.
    pub fail_eof: Option<Failure>,
}

#[derive(Default)]
pub struct ConsoleLog {
    pub events: Vec<Timed>,
    pub close_calls: usize,
}

impl ConsoleLog {
    pub fn events(&self) -> Vec<Event> {
        self.events.iter().map(|t| t.event.clone()).collect()
    }

    pub fn sent(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|t| match &t.event {
                Event::Sent(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Time of the first event equal to `event`.
    pub fn time_of(&self, event: &Event) -> Option<Instant> {
        self.events.iter().find(|t| &t.event == event).map(|t| t.at)
    }
}

pub type SharedLog = Arc<Mutex<ConsoleLog>>;

pub struct ScriptedConsole {
    script: Script,
    log: SharedLog,
    cancel: CancelToken,
    last_sent: Option<String>,
    ended: bool,
}

impl ScriptedConsole {
    fn record(&self, event: Event) {
        self.log.lock().events.push(Timed {
            event,
            at: Instant::now(),
        });
    }

    fn fail(&mut self, failure: Failure, expected: &str, timeout: Duration) -> TransportError {
        match failure {
            Failure::Timeout => TransportError::Timeout {
                expected: expected.to_string(),
                waited: timeout,
            },
            Failure::StreamEnded => {
                self.ended = true;
                TransportError::StreamEnded {
                    expected: expected.to_string(),
                    waited: Duration::from_millis(5),
                }
            }
            Failure::Cancel => {
                self.cancel.cancel();
                TransportError::Cancelled {
                    expected: expected.to_string(),
                }
            }
        }
    }
}

impl Console for ScriptedConsole {
    fn send_line(&mut self, text: &str) -> Result<(), TransportError> {
        if self.ended {
            return Err(TransportError::Closed);
        }
        self.record(Event::Sent(text.to_string()));
        self.last_sent = Some(text.to_string());
        Ok(())
    }

    fn expect(&mut self, literal: &str, timeout: Duration) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled {
                expected: literal.to_string(),
            });
        }
        if let Some((command, failure)) = self.script.fail_after_send.clone() {
            if self.last_sent.as_deref() == Some(command.as_str()) {
                return Err(self.fail(failure, literal, timeout));
            }
        }
        if let Some((expected, failure)) = self.script.fail_expect.clone() {
            if expected == literal {
                return Err(self.fail(failure, literal, timeout));
            }
        }
        self.record(Event::Expected(literal.to_string()));
        Ok(())
    }

    fn expect_eof(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if let Some(failure) = self.script.fail_eof {
            return Err(self.fail(failure, "<end of stream>", timeout));
        }
        self.ended = true;
        self.record(Event::ExpectedEof);
        Ok(())
    }

    fn close(&mut self) -> Option<String> {
        let first = {
            let mut log = self.log.lock();
            log.close_calls += 1;
            log.close_calls == 1
        };
        if first {
            self.record(Event::Closed);
            Some("exit code 0".to_string())
        } else {
            None
        }
    }
}

/// Hands out one scripted console per spawn.
#[derive(Default)]
pub struct FakeTransport {
    pub script: Mutex<Script>,
    pub log: SharedLog,
    pub spawns: Mutex<Vec<LaunchCommand>>,
    pub fail_spawn: AtomicBool,
}

impl FakeTransport {
    pub fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.fail_spawn.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().len()
    }
}

impl Transport for FakeTransport {
    fn spawn(
        &self,
        launch: &LaunchCommand,
        _transcript: Transcript,
        cancel: CancelToken,
    ) -> Result<Box<dyn Console>, TransportError> {
        self.spawns.lock().push(launch.clone());
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(TransportError::Spawn {
                program: launch.program().to_string(),
                message: "No such file or directory".to_string(),
            });
        }
        Ok(Box::new(ScriptedConsole {
            script: self.script.lock().clone(),
            log: Arc::clone(&self.log),
            cancel,
            last_sent: None,
            ended: false,
        }))
    }
}

/// Runtime whose instance is alive (or not) at cleanup as configured.
#[derive(Default)]
pub struct FakeRuntime {
    pub alive_at_cleanup: AtomicBool,
    pub fail_grow: AtomicBool,
    pub is_alive_calls: AtomicUsize,
    pub force_stop_calls: AtomicUsize,
    pub grow_calls: Mutex<Vec<(PathBuf, String)>>,
    pub queried: Mutex<Vec<ResourceId>>,
    /// Token whose tracked instances are captured at the liveness check.
    pub watched: Mutex<Option<CancelToken>>,
    pub live_at_check: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn alive() -> Arc<Self> {
        let runtime = Self::default();
        runtime.alive_at_cleanup.store(true, Ordering::SeqCst);
        Arc::new(runtime)
    }

    pub fn stopped() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn force_stops(&self) -> usize {
        self.force_stop_calls.load(Ordering::SeqCst)
    }

    pub fn liveness_checks(&self) -> usize {
        self.is_alive_calls.load(Ordering::SeqCst)
    }
}

impl Runtime for FakeRuntime {
    fn launch_command(&self, image: &Path, id: &ResourceId) -> LaunchCommand {
        LaunchCommand::new("fake-runtime")
            .arg(id.as_str())
            .arg(image.display().to_string())
    }

    fn is_alive(&self, id: &ResourceId) -> Result<bool, RuntimeError> {
        self.is_alive_calls.fetch_add(1, Ordering::SeqCst);
        self.queried.lock().push(id.clone());
        if let Some(token) = self.watched.lock().as_ref() {
            *self.live_at_check.lock() = token.live_instances();
        }
        Ok(self.alive_at_cleanup.load(Ordering::SeqCst))
    }

    fn force_stop(&self, _id: &ResourceId) -> Result<(), RuntimeError> {
        self.force_stop_calls.fetch_add(1, Ordering::SeqCst);
        self.alive_at_cleanup.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn grow_image(&self, image: &Path, increment: &str) -> Result<(), RuntimeError> {
        self.grow_calls
            .lock()
            .push((image.to_path_buf(), increment.to_string()));
        if self.fail_grow.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed {
                command: format!("qemu-img resize -f raw {} {}", image.display(), increment),
                status: "exit status: 1".to_string(),
                stderr: "Could not open image".to_string(),
            });
        }
        Ok(())
    }
}

/// Config with login pacing removed so tests run fast.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.session.username_delay_secs = 0;
    config.session.password_delay_secs = 0;
    config
}

/// A throwaway `.img` file.
pub fn temp_image() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("2021-03-04-raspios-buster-armhf-lite.img");
    std::fs::write(&path, b"not really a disk").expect("Failed to write image");
    (dir, path)
}

pub fn provisioner(
    config: Config,
    runtime: &Arc<FakeRuntime>,
    transport: &Arc<FakeTransport>,
) -> Provisioner {
    Provisioner::new(
        config,
        Arc::clone(runtime) as Arc<dyn Runtime>,
        Arc::clone(transport) as Arc<dyn Transport>,
    )
}

pub const SHELL: &str = "pi@raspberrypi:~$ ";
