//! The public error type for this library.
//!
//! Internally we use `anyhow` for context chains. At the public boundary every error carries an
//! `ErrorType` so that callers (and the presentation layer) can distinguish bad input, which is
//! always recoverable locally, from failures reported by a collaborator.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Internal result type used for context chains.
pub(crate) type Res<T> = std::result::Result<T, anyhow::Error>;

/// Public result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the public error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Malformed or incomplete user input. The triggering action was blocked and the current state
    /// was kept.
    Validation,
    /// The Bank API or streaming-progress collaborator reported a failure.
    Collaborator,
    /// The configuration file or directory is missing or invalid.
    Config,
    /// A filesystem or terminal operation failed.
    Io,
    /// The operation is not allowed in the current state or something unexpected happened.
    Internal,
}

serde_plain::derive_display_from_serialize!(ErrorType);

/// The public error type. It wraps an `anyhow::Error` and classifies it with an `ErrorType`.
pub struct Error {
    error_type: ErrorType,
    inner: anyhow::Error,
}

impl Error {
    pub(crate) fn new(error_type: ErrorType, inner: anyhow::Error) -> Self {
        Self { error_type, inner }
    }

    /// Creates a `Validation` error with `message`.
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Validation, anyhow::anyhow!(message.into()))
    }

    /// Creates a `Collaborator` error with `message`.
    pub(crate) fn collaborator(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Collaborator, anyhow::anyhow!(message.into()))
    }

    /// Creates an `Internal` error with `message`.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Internal, anyhow::anyhow!(message.into()))
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    pub fn is_validation(&self) -> bool {
        self.error_type == ErrorType::Validation
    }

    pub fn is_collaborator(&self) -> bool {
        self.error_type == ErrorType::Collaborator
    }

    /// The outermost message without the context chain. This is what gets surfaced to the user.
    pub fn message(&self) -> String {
        self.inner.to_string()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {:?}", self.error_type, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Converts an internal `anyhow` result into the public `Result` with an `ErrorType`.
pub(crate) trait IntoResult<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T>;
}

impl<T> IntoResult<T> for Res<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T> {
        self.map_err(|e| Error::new(error_type, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_pub_result_keeps_message() {
        let res: Res<()> = Err(anyhow::anyhow!("disk on fire")).context("Unable to save");
        let err = res.pub_result(ErrorType::Io).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Io);
        assert_eq!(err.message(), "Unable to save");
        assert!(format!("{err:?}").contains("disk on fire"));
    }

    #[test]
    fn test_error_type_display() {
        assert_eq!(ErrorType::Collaborator.to_string(), "collaborator");
        assert!(Error::validation("bad").is_validation());
        assert!(Error::collaborator("nope").is_collaborator());
    }
}
