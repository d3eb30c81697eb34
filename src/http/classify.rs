//! Error classification: turns transport failures and error responses into
//! typed [`Error`]s whose kind decides retryability.

use std::io;
use std::time::Duration;

use log::debug;
use reqwest::StatusCode;

use crate::error::{ApiError, Error, ErrorKind, ErrorObject};

/// Base kind for an HTTP status. Statuses with no dedicated kind are
/// [`ErrorKind::Unknown`].
pub fn status_kind(status: u16) -> ErrorKind {
    let Ok(status) = StatusCode::from_u16(status) else {
        return ErrorKind::Unknown;
    };

    match status {
        StatusCode::BAD_REQUEST => ErrorKind::BadRequest,
        StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
        StatusCode::FORBIDDEN => ErrorKind::Forbidden,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::NOT_ACCEPTABLE => ErrorKind::NotAcceptable,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        StatusCode::GONE => ErrorKind::Gone,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::PayloadTooLarge,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => ErrorKind::UnsupportedMedia,
        StatusCode::LOCKED => ErrorKind::Locked,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::TooManyRequests,
        StatusCode::INTERNAL_SERVER_ERROR => ErrorKind::InternalServer,
        StatusCode::BAD_GATEWAY => ErrorKind::BadGateway,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavailable,
        StatusCode::GATEWAY_TIMEOUT => ErrorKind::GatewayTimeout,
        StatusCode::INSUFFICIENT_STORAGE => ErrorKind::InsufficientStorage,
        _ => ErrorKind::Unknown,
    }
}

/// Refines a base kind by the server's error code. Codes unknown for the
/// status leave the base kind unchanged.
pub fn refine_kind(base: ErrorKind, error_code: &str) -> ErrorKind {
    use ErrorKind::*;

    match (base, error_code) {
        (BadRequest, "FieldValidationError") => FieldValidation,
        (BadRequest, "authorization_pending") => AuthorizationPending,
        (BadRequest, "invalid_client") => InvalidClient,
        (BadRequest, "invalid_grant") => InvalidGrant,
        (BadRequest, "bad_verification_code") => BadVerificationCode,
        (BadRequest, "unsupported_token_type") => UnsupportedTokenType,
        (Forbidden, "DiskSymlinkPasswordRequiredError") => PasswordRequired,
        (NotFound, "DiskNotFoundError") => PathNotFound,
        (NotFound, "DiskOperationNotFoundError") => OperationNotFound,
        (Conflict, "DiskPathDoesntExistsError") => ParentNotFound,
        (Conflict, "DiskPathPointsToExistentDirectoryError") => DirectoryExists,
        (Conflict, "DiskResourceAlreadyExistsError") => PathExists,
        (Conflict, "MD5DifferError") => Md5Differ,
        (Locked, "DiskResourceLockedError") => ResourceIsLocked,
        (Locked, "DiskUploadTrafficLimitExceeded") => UploadTrafficLimitExceeded,
        (TooManyRequests, "DiskResourceDownloadLimitExceededError") => {
            ResourceDownloadLimitExceeded
        }
        (base, _) => base,
    }
}

/// Builds the protocol error for a response with a non-success status.
///
/// The body is parsed as the API's error object on a best-effort basis; a
/// body that is not one still yields an error typed by status alone.
pub fn protocol_error(status: u16, body: &[u8]) -> Error {
    let object = if body.is_empty() {
        ErrorObject::default()
    } else {
        serde_json::from_slice::<ErrorObject>(body).unwrap_or_else(|e| {
            debug!("Error response body is not an error object: {}", e);
            ErrorObject::default()
        })
    };

    let base = status_kind(status);
    let kind = match object.error.as_deref() {
        Some(code) => refine_kind(base, code),
        None => base,
    };

    Error::Api(ApiError {
        kind,
        status,
        error_code: object.error,
        message: object.message,
        description: object.description,
    })
}

/// Classifies a reqwest failure that happened before a status was received
/// (or while the body was being read).
pub fn from_reqwest(error: reqwest::Error) -> Error {
    if error.is_builder() {
        return Error::InvalidRequest(error.to_string());
    }

    let (kind, message) = if error.is_timeout() {
        (ErrorKind::RequestTimeout, "Request timed out")
    } else if error.is_connect() {
        (ErrorKind::Connection, "Failed to connect")
    } else if error.is_redirect() {
        (ErrorKind::TooManyRedirects, "Too many redirects")
    } else if error.is_body() || error.is_decode() {
        (ErrorKind::Request, "Failed to transfer body")
    } else {
        (ErrorKind::Request, "Request failed")
    };

    Error::transport(kind, format!("{}: {}", message, error), error)
}

/// Classifies a ureq transport failure.
pub fn from_ureq(error: ureq::Transport) -> Error {
    use ureq::ErrorKind as Ureq;

    let kind = match error.kind() {
        Ureq::InvalidUrl | Ureq::UnknownScheme | Ureq::InsecureRequestHttpsOnly => {
            return Error::InvalidRequest(error.to_string());
        }
        Ureq::Dns | Ureq::ConnectionFailed | Ureq::ProxyConnect => ErrorKind::Connection,
        Ureq::TooManyRedirects => ErrorKind::TooManyRedirects,
        Ureq::Io if is_timeout(&error) => ErrorKind::RequestTimeout,
        _ => ErrorKind::Request,
    };

    Error::transport(kind, error.to_string(), error)
}

/// Classifies an I/O failure while reading a response body.
pub fn from_body_io(error: io::Error) -> Error {
    let kind = match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::RequestTimeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ErrorKind::Connection,
        _ => ErrorKind::Request,
    };

    Error::transport(kind, format!("Failed to read response body: {}", error), error)
}

/// A request that made no progress for `idle`.
pub fn idle_timeout(idle: Duration) -> Error {
    Error::transport(
        ErrorKind::RequestTimeout,
        format!("Request timed out: no progress for {:?}", idle),
        io::Error::from(io::ErrorKind::TimedOut),
    )
}

fn is_timeout(error: &ureq::Transport) -> bool {
    std::error::Error::source(error)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|io| {
            matches!(
                io.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            )
        })
}
