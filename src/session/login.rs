//! Username/password handshake on the console.
//!
//! The first-boot account setup keeps running after the login prompt
//! shows up, so each credential is sent only after a fixed pause. There
//! is no retry: a prompt that does not arrive in time fails the login.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::config::{SecureString, SessionConfig};
use crate::pty::{Console, TransportError};

/// Handshake steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    LoginPrompt,
    Username,
    PasswordPrompt,
    Password,
    ShellPrompt,
}

impl fmt::Display for LoginStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginStep::LoginPrompt => "login prompt",
            LoginStep::Username => "username",
            LoginStep::PasswordPrompt => "password prompt",
            LoginStep::Password => "password",
            LoginStep::ShellPrompt => "shell prompt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("{step}: {source}")]
    Step {
        step: LoginStep,
        #[source]
        source: TransportError,
    },

    #[error("cancelled before sending the {step}")]
    Cancelled { step: LoginStep },
}

impl LoginError {
    pub fn step(&self) -> LoginStep {
        match self {
            LoginError::Step { step, .. } | LoginError::Cancelled { step } => *step,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            LoginError::Cancelled { .. } => true,
            LoginError::Step { source, .. } => source.is_cancelled(),
        }
    }
}

/// Prompts, credentials and pacing of one login.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub username: String,
    pub password: SecureString,
    pub login_prompt: String,
    pub password_prompt: String,
    pub shell_prompt: String,
    pub timeout: Duration,
    pub username_delay: Duration,
    pub password_delay: Duration,
}

impl Handshake {
    pub fn from_config(session: &SessionConfig) -> Self {
        Self {
            username: session.username.clone(),
            password: session.password.clone(),
            login_prompt: session.login_prompt.clone(),
            password_prompt: session.password_prompt.clone(),
            shell_prompt: session.shell_prompt(),
            timeout: session.login_timeout(),
            username_delay: session.username_delay(),
            password_delay: session.password_delay(),
        }
    }

    /// Log in on `console`. Each prompt gets the full `timeout`.
    pub fn run(&self, console: &mut dyn Console, cancel: &CancelToken) -> Result<(), LoginError> {
        let step_err = |step| move |source| LoginError::Step { step, source };

        tracing::info!(timeout = ?self.timeout, "Waiting for the login prompt");
        console
            .expect(&self.login_prompt, self.timeout)
            .map_err(step_err(LoginStep::LoginPrompt))?;

        tracing::debug!(delay = ?self.username_delay, "Login prompt seen, pausing before the username");
        cancel.sleep(self.username_delay).map_err(|_| LoginError::Cancelled {
            step: LoginStep::Username,
        })?;
        console
            .send_line(&self.username)
            .map_err(step_err(LoginStep::Username))?;

        console
            .expect(&self.password_prompt, self.timeout)
            .map_err(step_err(LoginStep::PasswordPrompt))?;
        cancel.sleep(self.password_delay).map_err(|_| LoginError::Cancelled {
            step: LoginStep::Password,
        })?;
        console
            .send_line(self.password.expose())
            .map_err(step_err(LoginStep::Password))?;

        console
            .expect(&self.shell_prompt, self.timeout)
            .map_err(step_err(LoginStep::ShellPrompt))?;
        tracing::info!(user = %self.username, "Logged in");
        Ok(())
    }
}

/// Log in with the configured credentials and pacing.
pub fn login(
    console: &mut dyn Console,
    session: &SessionConfig,
    cancel: &CancelToken,
) -> Result<(), LoginError> {
    Handshake::from_config(session).run(console, cancel)
}
