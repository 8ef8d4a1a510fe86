use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by callers for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Corruption(_) => "CORRUPTION",
            Error::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// IO failures and an unavailable store are transient; a corrupted record or
    /// a rejected argument will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::StoreUnavailable(_) => true,

            Error::Serialization(_) => false,
            Error::Corruption(_) => false,
            Error::NotFound(_) => false,
            Error::InvalidArgument(_) => false,
            Error::InvalidConfig(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Returns true if the error came from the local durable store.
    ///
    /// A mutation that fails with a persistence error was not accepted and
    /// must not be reported to the user as queued.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Serialization(_) | Error::Corruption(_) | Error::StoreUnavailable(_)
        )
    }

    /// Adds context to an error by wrapping it in an Internal error.
    ///
    /// Persistence errors keep their variant so callers can still classify them.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use reclaim_core::Error;
    ///
    /// fn write_record() -> Result<(), Error> {
    ///     Err(Error::StoreUnavailable("disk detached".to_string()))
    /// }
    ///
    /// fn save_item() -> Result<(), Error> {
    ///     write_record().map_err(|e| e.with_context("failed to save queue item"))
    /// }
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        match self {
            Error::StoreUnavailable(msg) => Error::StoreUnavailable(format!("{}: {}", context, msg)),
            Error::Corruption(msg) => Error::Corruption(format!("{}: {}", context, msg)),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), format!("{}: {}", context, e))),
            other => Error::Internal(format!("{}: {}", context, other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
