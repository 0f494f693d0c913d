//! The crate's single public error type.
//!
//! Every operation in [`crate::facade::Facade`] and the lower components
//! returns `Result<T, AvrError>`. Internal plumbing with no public contract
//! (construction helpers, registry lookups consumed only inside the crate)
//! may still build on `anyhow::Error` and convert at the boundary.

use thiserror::Error;

/// Closed error taxonomy for AVR session operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvrError {
    /// The session is not in the `ready` state.
    #[error("AVR session is unavailable")]
    Unavailable,

    /// Dial/handshake failed, or the link dropped.
    #[error("connection to AVR failed: {0}")]
    ConnectionFailure(String),

    /// No matching response arrived within the command's deadline.
    #[error("timed out waiting for a response")]
    ResponseTimeout,

    /// The AVR returned an `E0[1-6]` error token.
    #[error("AVR returned error {0}")]
    Avr(String),

    /// Argument out of range, unknown source, ambiguous name, etc.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The queue or session was torn down while the request was outstanding.
    #[error("request was cancelled")]
    Cancelled,
}

impl AvrError {
    /// The raw `E0[1-6]` token for [`AvrError::Avr`], if this is one.
    pub fn source_code(&self) -> Option<&str> {
        match self {
            AvrError::Avr(code) => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_avr_error(&self) -> bool {
        matches!(self, AvrError::Avr(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AvrError::ResponseTimeout)
    }
}

pub type AvrResult<T> = Result<T, AvrError>;
