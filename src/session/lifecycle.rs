use std::time::Instant;

use serde::Serialize;

/// States of one provisioning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Created,
    Spawned,
    LoggedIn,
    SkippedLogin,
    FeaturesApplied,
    ShuttingDown,
    Closed,
}

impl SessionPhase {
    fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Closed, _) => false,
            // Error short-circuit: every open phase routes through cleanup.
            (_, Closed) => true,
            (Created, Spawned) => true,
            (Spawned, LoggedIn) | (Spawned, SkippedLogin) => true,
            (LoggedIn, FeaturesApplied) | (SkippedLogin, FeaturesApplied) => true,
            (FeaturesApplied, ShuttingDown) => true,
            _ => false,
        }
    }
}

/// One entry of the phase history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    pub phase: SessionPhase,
    /// Milliseconds since the session was created.
    pub at_ms: u64,
}

/// Phase tracker enforcing the session state machine.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    started: Instant,
    history: Vec<PhaseRecord>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            history: vec![PhaseRecord {
                phase: SessionPhase::Created,
                at_ms: 0,
            }],
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.history
            .last()
            .map(|record| record.phase)
            .unwrap_or(SessionPhase::Created)
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == SessionPhase::Closed
    }

    /// Move to `next`. Illegal transitions are refused and return `false`.
    pub fn advance(&mut self, next: SessionPhase) -> bool {
        let current = self.phase();
        if !current.can_advance_to(next) {
            tracing::warn!(from = ?current, to = ?next, "Refusing illegal session transition");
            return false;
        }
        self.history.push(PhaseRecord {
            phase: next,
            at_ms: self.started.elapsed().as_millis() as u64,
        });
        tracing::debug!(phase = ?next, "Session phase");
        true
    }

    pub fn history(&self) -> &[PhaseRecord] {
        &self.history
    }

    pub fn phases(&self) -> Vec<SessionPhase> {
        self.history.iter().map(|record| record.phase).collect()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
