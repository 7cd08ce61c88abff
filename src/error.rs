use std::io;

use http::StatusCode;
use n0_error::{AnyError, stack_error};

/// Errors from the tunnel agent lifecycle and socket checkout.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum AgentError {
    /// `listen()` was called on an agent that already has a listener.
    #[error("tunnel listener already started")]
    AlreadyStarted,

    /// The agent was destroyed; no sockets can be checked out.
    #[error("tunnel agent is closed")]
    Closed,

    /// Failed to bind the tunnel listener.
    #[error("failed to bind tunnel listener")]
    Bind {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl AgentError {
    /// True when the operation failed because the agent was destroyed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// True when `listen()` was called more than once.
    pub fn is_already_started(&self) -> bool {
        matches!(self, Self::AlreadyStarted { .. })
    }
}

/// Failure while forwarding an exchange through a tunnel socket.
///
/// Carries the status the broker reported to the external caller, when the
/// failure happened early enough for one to be written.
#[stack_error(add_meta, derive)]
pub struct ForwardError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl From<io::Error> for ForwardError {
    fn from(value: io::Error) -> Self {
        Self::terminated(value)
    }
}

impl ForwardError {
    /// Status reported to the external caller, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    /// Upstream failed before any response bytes were relayed downstream.
    pub(crate) fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    /// Failure after response headers were already relayed; the exchange was
    /// terminated without a synthesized response.
    pub(crate) fn terminated(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}

/// Connection resets and timeouts are routine on tunnel links and are
/// swallowed rather than logged.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut
    )
}
