//! Typed errors surfaced to end users through contract dispatch.

use crate::prelude::*;

/// Machine-readable error codes attached to a [`super::method::MethodResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No service matches the requested name.
    ServiceNotFound,
    /// The service exists but has no method by that name.
    MethodNotFound,
    /// One or more required inputs were missing.
    InputRequired,
    /// The service is configured but currently marked offline.
    ServiceOffline,
    /// The handler itself returned an error.
    HandlerError,
}

impl ErrorCode {
    /// Stable string form used in user-facing replies and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceNotFound => "ErrCodeServiceNotFound",
            Self::MethodNotFound => "ErrCodeMethodNotFound",
            Self::InputRequired => "ErrCodeInputRequired",
            Self::ServiceOffline => "ErrCodeServiceOffline",
            Self::HandlerError => "ErrCodeHandlerError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can terminate a contract dispatch before a handler runs, or
/// be returned by one.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// `GetService(name)` found nothing, case-insensitively.
    #[error("Service \"{0}\" not found")]
    ServiceNotFound(String),
    /// The service exists but has no such method.
    #[error("Method \"{0}\" not found")]
    MethodNotFound(String),
    /// One or more required inputs were missing, joined into one message.
    #[error("required input(s) missing: {0}")]
    InputRequired(String),
    /// The service is known but currently marked offline.
    #[error("service \"{0}\" is offline")]
    ServiceOffline(String),
    /// A pre-call or after-call hook vetoed the call.
    #[error("{0}")]
    HookRejected(String),
    /// The handler returned an error.
    #[error("{0}")]
    Handler(#[from] anyhow::Error),
}

impl ContractError {
    /// The [`ErrorCode`] to attach to the reply for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::InputRequired(_) => ErrorCode::InputRequired,
            Self::ServiceOffline(_) => ErrorCode::ServiceOffline,
            Self::HookRejected(_) | Self::Handler(_) => ErrorCode::HandlerError,
        }
    }
}
