//! Caller-facing status model.
//!
//! Every operation on the writer reports from this closed set of codes. A
//! permanent transport failure is latched and returned verbatim by every
//! subsequent operation.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    FailedPrecondition,
    DeadlineExceeded,
    Internal,
    Unavailable,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Status {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("Internal: {0}")]
    Internal(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Status {
    pub fn code(&self) -> Code {
        match self {
            Status::InvalidArgument(_) => Code::InvalidArgument,
            Status::FailedPrecondition(_) => Code::FailedPrecondition,
            Status::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Status::Internal(_) => Code::Internal,
            Status::Unavailable(_) => Code::Unavailable,
            Status::Cancelled(_) => Code::Cancelled,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Status::InvalidArgument(m)
            | Status::FailedPrecondition(m)
            | Status::DeadlineExceeded(m)
            | Status::Internal(m)
            | Status::Unavailable(m)
            | Status::Cancelled(m) => m,
        }
    }

    /// Transient statuses warrant a silent reconnect and resend; everything
    /// else latches the writer.
    pub fn is_transient(&self) -> bool {
        self.code() == Code::Unavailable
    }
}
