//! Errors
//!
//! The error taxonomy shared by every layer of the debugger client. Transport and
//! handshake failures are fatal to a connection, protocol failures reported by the VM
//! are delivered to the individual command that caused them.

use std::io;

use thiserror::Error;

use crate::parser::ParseError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("timed out {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected end of stream")]
    UnexpectedEos,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake returned error page {code} {reason}")]
    ErrorPage {
        code: u16,
        reason: String,
        body: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("detached from VM: {0}")]
    Detached(String),

    #[error("command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("debug context is no longer valid")]
    StaleContext,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether this error means the connection can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionRefused(_)
                | Error::Io(_)
                | Error::UnexpectedEos
                | Error::MalformedMessage(_)
                | Error::Handshake(_)
                | Error::ErrorPage { .. }
                | Error::ConnectionClosed
                | Error::Detached(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn check_fatal_errors() {
        assert!(Error::UnexpectedEos.is_fatal());
        assert!(Error::Detached("user request".to_string()).is_fatal());
        assert!(!Error::StaleContext.is_fatal());
        assert!(!Error::CommandFailed {
            command: "evaluate".to_string(),
            message: "ReferenceError: a is not defined".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn check_error_messages() {
        let err = Error::CommandFailed {
            command: "lookup".to_string(),
            message: "Object #<Object> has no method 'x'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command lookup failed: Object #<Object> has no method 'x'"
        );
    }
}
