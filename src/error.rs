//! Error types.

use crate::event::EventKey;

/// Status code reported by an event channel or timer service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("invalid argument")]
    InvalidArg,

    #[error("invalid state")]
    InvalidState,

    #[error("out of memory")]
    NoMem,

    #[error("not found")]
    NotFound,

    #[error("timed out")]
    Timeout,

    #[error("operation failed")]
    Fail,
}

/// Errors returned by the dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected before touching any collaborator.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The channel or timer service refused a construction step.
    /// Anything already set up for the registration has been torn down.
    #[error("registration for {key} failed")]
    RegistrationFailed {
        key: EventKey,
        #[source]
        code: ErrorCode,
    },

    /// The channel did not accept the event within the wait bound.
    #[error("posting {key} failed")]
    PostFailed {
        key: EventKey,
        #[source]
        code: ErrorCode,
    },

    /// A service thread could not be started.
    #[error("failed to start {task} thread")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Collaborator status code behind this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::InvalidArgument(_) | Error::Spawn { .. } => None,
            Error::RegistrationFailed { code, .. } | Error::PostFailed { code, .. } => Some(*code),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
