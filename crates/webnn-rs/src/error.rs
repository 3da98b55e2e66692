//! Error taxonomy shared by the builder, the lowering engine and the execution engine.
//!
//! Validation and lowering failures are captured where they happen and surfaced at the next
//! `build`/`compile`/`compute` call. Execution failures are returned per call and only poison the
//! graph when the device is lost.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`WebnnError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad arity, shape, type or axis detected while building the graph.
    Validation,
    /// Unsupported type, layout or rank detected while lowering to the native graph.
    Lowering,
    /// Missing input or backend failure during compute.
    Execution,
    /// Broken invariant; always fatal to the graph.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Lowering => "lowering",
            ErrorKind::Execution => "execution",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebnnError {
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("lowering error: {message}")]
    Lowering { message: String },
    #[error("execution error: {message}")]
    Execution { message: String, device_lost: bool },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl WebnnError {
    pub fn validation(message: impl Into<String>) -> Self {
        WebnnError::Validation {
            message: message.into(),
        }
    }

    pub fn lowering(message: impl Into<String>) -> Self {
        WebnnError::Lowering {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        WebnnError::Execution {
            message: message.into(),
            device_lost: false,
        }
    }

    pub fn device_lost(message: impl Into<String>) -> Self {
        WebnnError::Execution {
            message: message.into(),
            device_lost: true,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        WebnnError::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WebnnError::Validation { .. } => ErrorKind::Validation,
            WebnnError::Lowering { .. } => ErrorKind::Lowering,
            WebnnError::Execution { .. } => ErrorKind::Execution,
            WebnnError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            WebnnError::Validation { message }
            | WebnnError::Lowering { message }
            | WebnnError::Execution { message, .. }
            | WebnnError::Internal { message } => message,
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            WebnnError::Execution {
                device_lost: true,
                ..
            }
        )
    }

    /// Whether this error moves a graph into its terminal error state.
    pub fn poisons_graph(&self) -> bool {
        match self {
            WebnnError::Execution { device_lost, .. } => *device_lost,
            _ => true,
        }
    }

    /// Prefixes the message with call-site context, keeping the kind.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        match self {
            WebnnError::Validation { message } => WebnnError::Validation {
                message: format!("{context}: {message}"),
            },
            WebnnError::Lowering { message } => WebnnError::Lowering {
                message: format!("{context}: {message}"),
            },
            WebnnError::Execution {
                message,
                device_lost,
            } => WebnnError::Execution {
                message: format!("{context}: {message}"),
                device_lost,
            },
            WebnnError::Internal { message } => WebnnError::Internal {
                message: format!("{context}: {message}"),
            },
        }
    }
}

pub type WebnnResult<T> = Result<T, WebnnError>;

/// Attach call-site context to a fallible result.
pub trait ResultExt<T> {
    fn context(self, context: impl fmt::Display) -> WebnnResult<T>;

    fn with_context<C, F>(self, f: F) -> WebnnResult<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for WebnnResult<T> {
    fn context(self, context: impl fmt::Display) -> WebnnResult<T> {
        self.map_err(|err| err.with_context(context))
    }

    fn with_context<C, F>(self, f: F) -> WebnnResult<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.with_context(f()))
    }
}

macro_rules! validation_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::WebnnError::validation(format!($($arg)*)))
    };
}

macro_rules! validation_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::WebnnError::validation(format!($($arg)*)));
        }
    };
}

macro_rules! lowering_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::WebnnError::lowering(format!($($arg)*)));
        }
    };
}

pub(crate) use lowering_ensure;
pub(crate) use validation_bail;
pub(crate) use validation_ensure;
