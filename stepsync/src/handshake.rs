//! The start / notify / await-completion handshake.
//!
//! A [`Session`] is created per step with a copy of the endpoint
//! configuration. [`Session::begin`] sends `"start"`, waits at most
//! [`START_ACK_WAIT`] for `"started"`, then sends `"notify_completion"` and
//! records the time of the acknowledgment. After that the owner calls
//! [`Session::poll`] once per tick; each poll checks for a ready reply
//! without waiting and, if there is none, compares the time since the
//! acknowledgment with the timeout budget.
//!
//! ```text
//!   Idle ──begin──▶ AwaitingStartAck ──"started"──▶ AwaitingCompletion ──"completed"──▶ Completed
//!    │                     │                               │
//!    └─disabled─▶ Completed └─timeout / other reply─▶ Failed ◀─timeout / other reply──┘
//! ```
//!
//! The session never retries and never reports more than once: the outcome is
//! returned by value exactly when the phase becomes terminal.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::channel::{ChannelError, ChannelManager, Connector};
use crate::config::{COMPLETION_POLL_WAIT, ConfigError, EndpointConfig, START_ACK_WAIT};
use crate::protocol::{Reply, Request};
use crate::runtime::timing::{Clock, Millis, MonoInstant, TickerError};
use crate::trace::{debug, info, warn};

/// Handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    AwaitingStartAck,
    AwaitingCompletion,
    Completed,
    Failed,
}

impl Phase {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingStartAck => "awaiting-start-ack",
            Self::AwaitingCompletion => "awaiting-completion",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a step failed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The step is enabled but no channel is open.
    #[error("service is enabled but no service address is configured")]
    ChannelAbsent,
    /// No reply to "start" within the acknowledgment window.
    #[error("service did not acknowledge start within {0:?}")]
    StartAckTimeout(Duration),
    /// No completion reply within the budget.
    #[error("service did not complete within {budget:?} (waited {elapsed:?})")]
    CompletionTimeout { elapsed: Duration, budget: Duration },
    /// A reply outside the protocol for the current phase.
    #[error("unexpected reply from service: {0:?}")]
    UnexpectedReply(String),
    /// The service answered "error".
    #[error("service rejected the request")]
    ServiceRejected,
    #[error("timeout_sec must be a finite, non-negative number of seconds (got {0})")]
    InvalidTimeout(f64),
    /// Transport failure while the session was in flight.
    #[error("service channel failed: {0}")]
    Channel(#[from] ChannelError),
    /// The completion poll could not be scheduled.
    #[error("cannot schedule completion poll: {0}")]
    Scheduler(#[from] TickerError),
}

impl From<ConfigError> for HandshakeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidTimeout(secs) => Self::InvalidTimeout(secs),
        }
    }
}

/// Terminal outcome of one step.
#[derive(Debug)]
pub enum StepOutcome {
    Success,
    Failure(HandshakeError),
}

impl StepOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The failure reason, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&HandshakeError> {
        match self {
            Self::Success => None,
            Self::Failure(err) => Some(err),
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure(err) => write!(f, "failure: {err}"),
        }
    }
}

/// Result of driving a session one step forward.
#[derive(Debug)]
pub enum Progress {
    /// Still waiting for completion; poll again on the next tick.
    Pending,
    /// The session just became terminal.
    Done(StepOutcome),
    /// The session is not awaiting completion; there is nothing to do.
    Inactive,
}

/// One in-flight execution of the handshake.
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    enabled: bool,
    budget: Duration,
    started_at: Option<MonoInstant<Millis>>,
}

impl Session {
    /// New idle session. The budget is copied now and never re-read.
    #[must_use]
    pub const fn new(config: &EndpointConfig) -> Self {
        Self {
            phase: Phase::Idle,
            enabled: config.enabled,
            budget: config.timeout,
            started_at: None,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }

    /// When the start acknowledgment arrived.
    #[must_use]
    pub const fn started_at(&self) -> Option<MonoInstant<Millis>> {
        self.started_at
    }

    /// Runs the start exchange.
    ///
    /// Returns [`Progress::Pending`] once the service has acknowledged and
    /// `"notify_completion"` is on the wire, or the terminal outcome. Any
    /// failure involving the channel closes it before returning.
    pub fn begin<K: Connector>(
        &mut self,
        channels: &mut ChannelManager<K>,
        clock: &impl Clock,
    ) -> Progress {
        if self.phase != Phase::Idle {
            return Progress::Inactive;
        }
        if !self.enabled {
            debug!("service disabled for this step");
            return self.succeed();
        }
        if !channels.is_open() {
            warn!("service enabled but no channel is open");
            return self.fail(HandshakeError::ChannelAbsent);
        }

        self.phase = Phase::AwaitingStartAck;
        if let Err(e) = channels.send(&Request::Start) {
            return self.fail_closing(channels, e.into());
        }
        debug!(wait = ?START_ACK_WAIT, "start sent");

        match channels.try_receive(START_ACK_WAIT) {
            Ok(Some(Reply::Started)) => {}
            Ok(Some(other)) => {
                warn!(reply = %other, "unexpected reply to start");
                return self.fail_closing(channels, HandshakeError::UnexpectedReply(other.to_string()));
            }
            Ok(None) => {
                warn!(wait = ?START_ACK_WAIT, "start not acknowledged");
                return self.fail_closing(channels, HandshakeError::StartAckTimeout(START_ACK_WAIT));
            }
            Err(e) => {
                warn!(error = %e, "start acknowledgment failed");
                return self.fail_closing(channels, e.into());
            }
        }

        if let Err(e) = channels.send(&Request::NotifyCompletion) {
            return self.fail_closing(channels, e.into());
        }
        let now = clock.now();
        self.started_at = Some(now);
        self.phase = Phase::AwaitingCompletion;
        info!(budget = ?self.budget, "start acknowledged, awaiting completion");
        Progress::Pending
    }

    /// Checks once for the completion reply without waiting.
    ///
    /// A reply that is ready wins over an expired budget.
    pub fn poll<K: Connector>(
        &mut self,
        channels: &mut ChannelManager<K>,
        clock: &impl Clock,
    ) -> Progress {
        if self.phase != Phase::AwaitingCompletion {
            return Progress::Inactive;
        }
        match channels.try_receive(COMPLETION_POLL_WAIT) {
            Ok(Some(Reply::Completed)) => {
                info!("service completed");
                self.succeed()
            }
            Ok(Some(Reply::Error)) => {
                warn!("service answered error to notify_completion");
                self.fail(HandshakeError::ServiceRejected)
            }
            Ok(Some(other)) => {
                warn!(reply = %other, "unexpected reply to notify_completion");
                self.fail(HandshakeError::UnexpectedReply(other.to_string()))
            }
            Ok(None) => {
                let elapsed = self.elapsed(clock);
                if elapsed >= self.budget {
                    warn!(elapsed = ?elapsed, budget = ?self.budget, "completion timed out");
                    self.fail_closing(
                        channels,
                        HandshakeError::CompletionTimeout {
                            elapsed,
                            budget: self.budget,
                        },
                    )
                } else {
                    Progress::Pending
                }
            }
            Err(e) => {
                warn!(error = %e, "completion poll failed");
                self.fail_closing(channels, e.into())
            }
        }
    }

    /// Time since the start acknowledgment, zero before it.
    pub fn elapsed(&self, clock: &impl Clock) -> Duration {
        self.started_at
            .map_or(Duration::ZERO, |start| clock.now().saturating_since(start).to_std())
    }

    fn succeed(&mut self) -> Progress {
        self.phase = Phase::Completed;
        Progress::Done(StepOutcome::Success)
    }

    fn fail(&mut self, err: HandshakeError) -> Progress {
        self.phase = Phase::Failed;
        Progress::Done(StepOutcome::Failure(err))
    }

    fn fail_closing<K: Connector>(
        &mut self,
        channels: &mut ChannelManager<K>,
        err: HandshakeError,
    ) -> Progress {
        channels.close_all();
        self.fail(err)
    }
}
