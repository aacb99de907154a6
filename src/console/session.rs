//! Phase engine: one exclusive owner of a console transport, advancing
//! through a fixed sequence of marker-gated phases.
//!
//! A phase blocks until its marker shows up or its timeout fires. On a match
//! the phase's input lines are sent, in order, and the session moves on. Any
//! failure leaves the session in a terminal failed state; nothing is retried.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio::time::Instant;

use super::transport::{ConsoleTransport, OutputSink, TransportError};
use crate::logging::Transcript;

const REDACTED: &str = "********";

/// One line sent to the console once a phase's marker has matched.
#[derive(Clone, PartialEq, Eq)]
pub enum Input {
    Line(String),
    /// Sent verbatim but shown as `********` in the transcript and logs.
    Secret(String),
}

impl Input {
    pub fn text(&self) -> &str {
        match self {
            Input::Line(s) | Input::Secret(s) => s,
        }
    }

    pub fn display(&self) -> &str {
        match self {
            Input::Line(s) => s,
            Input::Secret(_) => REDACTED,
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Line(s) => f.debug_tuple("Line").field(s).finish(),
            Input::Secret(_) => f.debug_tuple("Secret").field(&REDACTED).finish(),
        }
    }
}

/// One step of the installation protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolePhase {
    pub name: String,
    pub marker: String,
    pub actions: Vec<Input>,
    /// `None` inherits the session default.
    pub timeout: Option<Duration>,
    /// A timeout in this phase is a failed reachability probe.
    pub network_probe: bool,
}

impl ConsolePhase {
    pub fn new(name: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            marker: marker.into(),
            actions: Vec::new(),
            timeout: None,
            network_probe: false,
        }
    }

    pub fn send(mut self, line: impl Into<String>) -> Self {
        self.actions.push(Input::Line(line.into()));
        self
    }

    pub fn send_secret(mut self, secret: impl Into<String>) -> Self {
        self.actions.push(Input::Secret(secret.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn network_probe(mut self) -> Self {
        self.network_probe = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub phase: String,
    /// Position of this phase in the session, starting at 0.
    pub index: usize,
    /// Console output up to and including the marker.
    pub output: String,
    pub elapsed: Duration,
}

/// Prompts of the forced first-login password change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPrompts {
    pub password: String,
    pub current_password: String,
    pub new_password: String,
    pub retype_password: String,
}

impl Default for CredentialPrompts {
    fn default() -> Self {
        Self {
            password: "Password:".into(),
            current_password: "UNIX password:".into(),
            new_password: "New password:".into(),
            retype_password: "Retype new password:".into(),
        }
    }
}

/// Completed password change: one result per prompt answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialChangeAck {
    pub phases: Vec<PhaseResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Finished,
    Failed { phase: String },
    /// Released without reaching `finish`.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => f.write_str("active"),
            SessionState::Finished => f.write_str("finished"),
            SessionState::Failed { phase } => write!(f, "failed in phase '{phase}'"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error(
        "phase '{phase}' timed out after {}s waiting for {marker:?}",
        .timeout.as_secs()
    )]
    #[diagnostic(
        code(isoprov::phase_timeout),
        help("the installer hung or printed something unexpected; see the console transcript")
    )]
    Timeout {
        phase: String,
        marker: String,
        timeout: Duration,
        elapsed: Duration,
    },

    #[error(
        "network probe failed in phase '{phase}': no {marker:?} within {}s",
        .timeout.as_secs()
    )]
    #[diagnostic(
        code(isoprov::network_probe_failed),
        help("check [temp_network] address, interface and gateway")
    )]
    NetworkProbeFailed {
        phase: String,
        marker: String,
        timeout: Duration,
    },

    #[error("console stream closed during phase '{phase}'")]
    #[diagnostic(code(isoprov::stream_closed))]
    StreamClosed { phase: String },

    #[error("console transport failed during phase '{phase}'")]
    Transport {
        phase: String,
        #[source]
        source: TransportError,
    },

    #[error("console session is {state}; no further phases can run")]
    #[diagnostic(code(isoprov::session_not_active))]
    NotActive { state: SessionState },
}

/// Drives one console through a linear sequence of phases.
pub struct ConsoleSession<T: ConsoleTransport> {
    transport: Option<T>,
    transcript: Option<Transcript>,
    state: SessionState,
    current_phase_index: usize,
    last_output: String,
    default_timeout: Duration,
}

impl<T: ConsoleTransport> ConsoleSession<T> {
    pub fn new(transport: T, transcript: Transcript, default_timeout: Duration) -> Self {
        tracing::debug!(transcript = %transcript.path().display(), "console session opened");
        Self {
            transport: Some(transport),
            transcript: Some(transcript),
            state: SessionState::Active,
            current_phase_index: 0,
            last_output: String::new(),
            default_timeout,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn current_phase_index(&self) -> usize {
        self.current_phase_index
    }

    /// Full output captured by the last completed phase.
    pub fn last_output(&self) -> &str {
        &self.last_output
    }

    pub fn transcript_path(&self) -> Option<&Path> {
        self.transcript.as_ref().map(Transcript::path)
    }

    fn record(&mut self, text: &str) {
        self.transcript.append(text);
    }

    /// Wait for `phase.marker`, then send the phase's input lines.
    pub async fn advance(&mut self, phase: &ConsolePhase) -> Result<PhaseResult, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive {
                state: self.state.clone(),
            });
        }
        let timeout = phase.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        tracing::debug!(
            phase = %phase.name,
            marker = %phase.marker,
            timeout_s = timeout.as_secs(),
            "waiting for marker"
        );

        let read = match self.transport.as_mut() {
            Some(transport) => {
                transport
                    .read_until(&phase.marker, timeout, &mut self.transcript)
                    .await
            }
            None => Err(TransportError::Closed {
                pending: String::new(),
            }),
        };
        let output = match read {
            Ok(output) => output,
            Err(e) => return Err(self.fail(phase, timeout, started.elapsed(), e)),
        };

        for input in &phase.actions {
            let sent = match self.transport.as_mut() {
                Some(transport) => transport.write_line(input.text()).await,
                None => Err(TransportError::Closed {
                    pending: String::new(),
                }),
            };
            if let Err(e) = sent {
                return Err(self.fail(phase, timeout, started.elapsed(), e));
            }
            self.record(&format!("\n>>> {}\n", input.display()));
            tracing::debug!(phase = %phase.name, input = input.display(), "sent");
        }

        let elapsed = started.elapsed();
        let result = PhaseResult {
            phase: phase.name.clone(),
            index: self.current_phase_index,
            output: output.clone(),
            elapsed,
        };
        self.current_phase_index += 1;
        self.last_output = output;
        tracing::info!(
            phase = %phase.name,
            elapsed_ms = elapsed.as_millis() as u64,
            "phase complete"
        );
        Ok(result)
    }

    /// Answer the forced first-login password change.
    ///
    /// The installer checks the answers by position: `old` at the login
    /// password prompt and again as the current password, then `new` twice.
    /// Each answer waits for its own prompt.
    pub async fn send_credential_change_sequence(
        &mut self,
        prompts: &CredentialPrompts,
        old: &str,
        new: &str,
    ) -> Result<CredentialChangeAck, SessionError> {
        let steps = [
            ConsolePhase::new("authenticate", &prompts.password).send_secret(old),
            ConsolePhase::new("confirm-current-password", &prompts.current_password)
                .send_secret(old),
            ConsolePhase::new("enter-new-password", &prompts.new_password).send_secret(new),
            ConsolePhase::new("retype-new-password", &prompts.retype_password).send_secret(new),
        ];
        let mut phases = Vec::with_capacity(steps.len());
        for step in &steps {
            phases.push(self.advance(step).await?);
        }
        Ok(CredentialChangeAck { phases })
    }

    fn fail(
        &mut self,
        phase: &ConsolePhase,
        timeout: Duration,
        elapsed: Duration,
        err: TransportError,
    ) -> SessionError {
        let error = match err {
            TransportError::Timeout { .. } if phase.network_probe => {
                SessionError::NetworkProbeFailed {
                    phase: phase.name.clone(),
                    marker: phase.marker.clone(),
                    timeout,
                }
            }
            TransportError::Timeout { .. } => SessionError::Timeout {
                phase: phase.name.clone(),
                marker: phase.marker.clone(),
                timeout,
                elapsed,
            },
            TransportError::Closed { .. } => SessionError::StreamClosed {
                phase: phase.name.clone(),
            },
            other => SessionError::Transport {
                phase: phase.name.clone(),
                source: other,
            },
        };

        self.record(&format!("\n[isoprov] {error}\n"));
        tracing::error!(phase = %phase.name, "{error}");
        self.state = SessionState::Failed {
            phase: phase.name.clone(),
        };
        error
    }

    /// Mark the installation complete and release the console.
    pub async fn finish(&mut self) -> Result<Option<PathBuf>, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive {
                state: self.state.clone(),
            });
        }
        self.state = SessionState::Finished;
        self.close().await
    }

    /// Release the transport and the transcript. Safe to call more than
    /// once; only the first call does anything. Returns the transcript's
    /// final path the first time.
    pub async fn close(&mut self) -> Result<Option<PathBuf>, SessionError> {
        if self.state == SessionState::Active {
            self.state = SessionState::Closed;
        }

        let closed = match self.transport.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        };

        let path = self.transcript.take().map(|transcript| {
            let success = self.state == SessionState::Finished;
            let path = transcript.finish(success);
            tracing::info!(path = %path.display(), state = %self.state, "console transcript closed");
            path
        });

        match closed {
            Ok(()) => Ok(path),
            Err(e) => Err(SessionError::Transport {
                phase: "close".into(),
                source: e,
            }),
        }
    }
}
