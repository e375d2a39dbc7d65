use std::fmt;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies fatal conditions raised while building or preparing an IR.
///
/// Candidate rejections (a pattern that does not match, an unsafe inplace
/// proposal) are never reported through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or contradictory user options.
    Configuration,
    /// An invariant that correct transforms never break was found broken.
    Internal,
    /// The imported model is malformed.
    UserModel,
    /// A requested feature combination is not implemented.
    Unsupported,
    /// Lookup of an op, tensor or graph id that does not exist (any more).
    NotFound,
    /// A tensor id was inserted twice into a registry.
    TensorIdCollision,
    /// Data dependencies plus constraints contain a cycle.
    Unschedulable,
    /// `prepare` was called on an IR that is not in the unprepared state.
    AlreadyPrepared,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Internal => "internal error",
            ErrorKind::UserModel => "model error",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NotFound => "not found",
            ErrorKind::TensorIdCollision => "tensor id collision",
            ErrorKind::Unschedulable => "unschedulable",
            ErrorKind::AlreadyPrepared => "already prepared",
        };
        f.write_str(name)
    }
}

/// Error raised by the IR core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn user_model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserModel, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn collision(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TensorIdCollision, message)
    }

    pub fn unschedulable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unschedulable, message)
    }

    pub fn already_prepared(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyPrepared, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefixes the message with additional context, keeping the kind.
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }
}

/// Early-returns an `Error` of the given kind, formatted like `format!`.
#[macro_export]
macro_rules! bail {
    ($ctor:ident, $($arg:tt)+) => {
        return Err($crate::error::Error::$ctor(format!($($arg)+)))
    };
}
