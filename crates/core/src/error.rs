//! Error types shared by every core operation.
//!
//! Every mutating entry point is atomic: either the full effect commits or
//! nothing does. The variants here separate caller-correctable failures from
//! administrator misconfiguration and from post-commit delivery warnings, so
//! an outer layer can decide how each is surfaced.

/// Errors produced by the specimen request core.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Caller-correctable input problem. No side effects were committed.
    #[error("{0}")]
    Validation(String),

    /// The caller lacks the capability required for the operation.
    #[error("{0}")]
    Permission(String),

    /// An administrator-configured requestability rule is broken. The
    /// triggering mutation was fully aborted.
    #[error(
        "A requestability rule is configured incorrectly. \
         Please report this problem to an administrator. Error details: {message}"
    )]
    InvalidRule { message: String },

    /// A referenced request, requirement, status, actor or site does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Mail transport failure after the core mutation already committed.
    /// Reported as a partial-success warning; never rolls anything back.
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),
}

impl RequestError {
    /// Shorthand for a [`RequestError::Validation`] with a formatted message.
    pub fn validation(message: impl Into<String>) -> Self {
        RequestError::Validation(message.into())
    }

    /// Shorthand for a [`RequestError::NotFound`] naming the missing entity.
    pub fn not_found(entity: impl Into<String>) -> Self {
        RequestError::NotFound(entity.into())
    }
}

impl From<srt_types::TextError> for RequestError {
    fn from(err: srt_types::TextError) -> Self {
        RequestError::Validation(err.to_string())
    }
}

pub type RequestResult<T> = std::result::Result<T, RequestError>;
