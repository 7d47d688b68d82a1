//! Caller-facing status codes.
//!
//! Every gateway operation fails with a [`Status`]: a [`Code`] from a small,
//! fixed taxonomy plus a human readable message. Storage and coordination
//! failures live in [`crate::cluster::BrokerError`] and are mapped onto this
//! taxonomy with `BrokerError::to_status()`.
//!
//! Async publish sessions report per-request validation failures in-band as a
//! [`PublishAsyncError`], which carries a [`PublishAsyncErrorCode`] instead of a
//! full status so that one bad request does not end the session.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Status>;

/// Status code taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// Stream or partition does not exist.
    NotFound,
    /// A stream with the same name already exists.
    AlreadyExists,
    /// Empty or malformed request fields.
    InvalidArgument,
    /// The operation is not valid in the current state, e.g. reading a paused
    /// partition or reading from a non-leader without accepting replica reads.
    FailedPrecondition,
    /// Reached the logical end of a readonly partition.
    ResourceExhausted,
    /// Synchronous publish ack was not received in time.
    DeadlineExceeded,
    /// Unexpected local failure.
    Internal,
    /// The caller canceled the call.
    Canceled,
    /// Anything else.
    Unknown,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::InvalidArgument => "invalid_argument",
            Code::FailedPrecondition => "failed_precondition",
            Code::ResourceExhausted => "resource_exhausted",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::Internal => "internal",
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error returned to callers of the gateway.
#[derive(Clone, Debug, PartialEq, Eq, ThisError, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error codes carried by in-band async publish errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishAsyncErrorCode {
    NotFound,
    BadRequest,
    Readonly,
    Internal,
    Unknown,
}

/// An async publish failure correlated to a single request.
#[derive(Clone, Debug, PartialEq, Eq, ThisError, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct PublishAsyncError {
    pub code: PublishAsyncErrorCode,
    pub message: String,
}

impl PublishAsyncError {
    pub fn new(code: PublishAsyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<PublishAsyncError> for Status {
    fn from(e: PublishAsyncError) -> Self {
        let code = match e.code {
            PublishAsyncErrorCode::NotFound => Code::NotFound,
            PublishAsyncErrorCode::BadRequest => Code::InvalidArgument,
            PublishAsyncErrorCode::Readonly => Code::FailedPrecondition,
            PublishAsyncErrorCode::Internal => Code::Internal,
            PublishAsyncErrorCode::Unknown => Code::Unknown,
        };
        Status::new(code, e.message)
    }
}

impl From<Status> for PublishAsyncError {
    fn from(s: Status) -> Self {
        let code = match s.code {
            Code::NotFound => PublishAsyncErrorCode::NotFound,
            Code::InvalidArgument => PublishAsyncErrorCode::BadRequest,
            Code::FailedPrecondition => PublishAsyncErrorCode::Readonly,
            Code::Internal => PublishAsyncErrorCode::Internal,
            _ => PublishAsyncErrorCode::Unknown,
        };
        PublishAsyncError::new(code, s.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_includes_code_and_message() {
        let status = Status::not_found("no such stream: orders");
        assert_eq!(status.to_string(), "not_found: no such stream: orders");
        assert_eq!(status.code(), Code::NotFound);
    }

    #[test]
    fn test_async_error_conversion() {
        let cases = [
            (PublishAsyncErrorCode::NotFound, Code::NotFound),
            (PublishAsyncErrorCode::BadRequest, Code::InvalidArgument),
            (PublishAsyncErrorCode::Readonly, Code::FailedPrecondition),
            (PublishAsyncErrorCode::Internal, Code::Internal),
            (PublishAsyncErrorCode::Unknown, Code::Unknown),
        ];
        for (async_code, code) in cases {
            let status: Status = PublishAsyncError::new(async_code, "x").into();
            assert_eq!(status.code, code);
        }
    }

    #[test]
    fn test_status_to_async_error() {
        let err: PublishAsyncError = Status::failed_precondition("readonly partition: 0").into();
        assert_eq!(err.code, PublishAsyncErrorCode::Readonly);

        let err: PublishAsyncError = Status::deadline_exceeded("late").into();
        assert_eq!(err.code, PublishAsyncErrorCode::Unknown);
    }
}
