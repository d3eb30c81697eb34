//! Error types shared by every layer of the client.
//!
//! All failures surface as [`Error`]. Code that needs to branch on the kind of
//! failure uses [`Error::kind`], which returns a flat [`ErrorKind`]. Kinds form
//! a small hierarchy (for example [`ErrorKind::PathExists`] is a
//! [`ErrorKind::Conflict`]) that mirrors how the server refines status codes
//! with error codes.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::operation::OperationStatus;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used as the source of transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Client errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The request could not be sent or the response could not be received.
    #[error("{message}")]
    Transport {
        kind: ErrorKind,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The server answered with an error status.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A successful response carried a body that could not be decoded.
    #[error("Server returned invalid response: {0}")]
    InvalidResponse(String),

    /// A streaming payload or download sink could not be reset before a retry.
    #[error("Failed to rewind payload before retrying: {0}")]
    Rewind(#[source] io::Error),

    /// Writing a downloaded body into its sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A polled operation reached the `failed` state.
    #[error("Asynchronous operation failed")]
    OperationFailed { status: OperationStatus },

    /// A polled operation was still running when the poll timeout expired.
    #[error("Asynchronous operation did not complete within {timeout:?} ({polls} status queries)")]
    PollTimeout { timeout: Duration, polls: u32 },

    /// The session was closed before the request was sent.
    #[error("Session is closed")]
    SessionClosed,

    /// The request could not be built (bad header value, unknown backend, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub(crate) fn transport(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Flat discriminator for branching on the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { kind, .. } => *kind,
            Error::Api(api) => api.kind,
            Error::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Error::Rewind(_) => ErrorKind::Rewind,
            Error::Io(_) => ErrorKind::Io,
            Error::OperationFailed { .. } => ErrorKind::OperationFailed,
            Error::PollTimeout { .. } => ErrorKind::PollTimeout,
            Error::SessionClosed => ErrorKind::SessionClosed,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the built-in policy retries this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Local failures that no retry can fix, whatever the caller asks for.
    pub(crate) fn retry_forbidden(&self) -> bool {
        matches!(
            self,
            Error::Rewind(_) | Error::Io(_) | Error::SessionClosed | Error::InvalidRequest(_)
        )
    }

    /// HTTP status of a protocol error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(api) => Some(api.status),
            _ => None,
        }
    }
}

/// Kinds of failures.
///
/// Transport kinds descend from [`ErrorKind::Request`]; protocol kinds descend
/// from the kind matching their HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Transport
    Request,
    Connection,
    RequestTimeout,
    TooManyRedirects,

    // Protocol, 4xx
    BadRequest,
    FieldValidation,
    AuthorizationPending,
    InvalidClient,
    InvalidGrant,
    BadVerificationCode,
    UnsupportedTokenType,
    Unauthorized,
    Forbidden,
    PasswordRequired,
    NotFound,
    PathNotFound,
    OperationNotFound,
    NotAcceptable,
    Conflict,
    ParentNotFound,
    PathExists,
    DirectoryExists,
    Md5Differ,
    Gone,
    PayloadTooLarge,
    UnsupportedMedia,
    Locked,
    ResourceIsLocked,
    UploadTrafficLimitExceeded,
    TooManyRequests,
    ResourceDownloadLimitExceeded,

    // Protocol, 5xx and unmapped
    InternalServer,
    BadGateway,
    Unavailable,
    GatewayTimeout,
    InsufficientStorage,
    Unknown,

    // Validation and local
    InvalidResponse,
    Rewind,
    Io,
    OperationFailed,
    PollTimeout,
    SessionClosed,
    InvalidRequest,
}

impl ErrorKind {
    /// Immediate parent in the kind hierarchy.
    pub fn parent(self) -> Option<ErrorKind> {
        use ErrorKind::*;

        match self {
            Connection | RequestTimeout | TooManyRedirects => Some(Request),
            FieldValidation | AuthorizationPending | InvalidClient | InvalidGrant
            | BadVerificationCode | UnsupportedTokenType => Some(BadRequest),
            PasswordRequired => Some(Forbidden),
            PathNotFound | OperationNotFound => Some(NotFound),
            ParentNotFound | PathExists | Md5Differ => Some(Conflict),
            DirectoryExists => Some(PathExists),
            ResourceIsLocked | UploadTrafficLimitExceeded => Some(Locked),
            ResourceDownloadLimitExceeded => Some(TooManyRequests),
            _ => None,
        }
    }

    /// True if `self` is `ancestor` or descends from it.
    pub fn is_a(self, ancestor: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// Built-in retryability verdict.
    pub fn is_retryable(self) -> bool {
        use ErrorKind::*;

        if self.is_a(Request) {
            return true;
        }

        matches!(
            self,
            TooManyRequests
                | InternalServer
                | BadGateway
                | Unavailable
                | GatewayTimeout
                | Unknown
                | InvalidResponse
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error body returned by the API alongside a failing status.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ErrorObject {
    pub message: Option<String>,
    pub description: Option<String>,
    pub error: Option<String>,
}

/// A protocol error: non-success status, refined by the server's error code.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status: u16,
    /// Unique error code as returned by the API (`error` field).
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub description: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            parts.push(message.to_string());
        }
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            parts.push(format!(
                "Error description: {}.",
                description.trim_end_matches('.')
            ));
        }
        if let Some(code) = self.error_code.as_deref().filter(|c| !c.is_empty()) {
            parts.push(format!("Error code: {}", code));
        }
        parts.push(format!("Status code: {}", self.status));

        write!(f, "{}", parts.join(" | "))
    }
}

impl std::error::Error for ApiError {}
