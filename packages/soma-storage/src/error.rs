/// Error taxonomy shared by every layer of the engine.
///
/// Low layers never swallow errors: adapters classify each failure into
/// one of these variants and the classification travels verbatim to the
/// caller. Only `TransientIo` is ever retried.
use thiserror::Error;

/// Operation class used by the backpressure controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Read,
    Write,
}

impl std::fmt::Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpClass::Read => write!(f, "read"),
            OpClass::Write => write!(f, "write"),
        }
    }
}

/// Coarse error kind, used for dispatch and for CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    TransientIo,
    PermissionDenied,
    QuotaExceeded,
    Invalid,
    CircuitOpen,
    Overloaded,
    Cancelled,
    EmbedFailed,
    IndexUnavailable,
    Fatal,
}

impl ErrorKind {
    /// Process exit code for CLIs wrapping the core.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Invalid => 1,
            ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::TransientIo
            | ErrorKind::PermissionDenied
            | ErrorKind::QuotaExceeded
            | ErrorKind::IndexUnavailable
            | ErrorKind::EmbedFailed => 2,
            ErrorKind::CircuitOpen | ErrorKind::Overloaded => 3,
            ErrorKind::Cancelled => 4,
            ErrorKind::Fatal => 5,
        }
    }
}

/// Unified error type. User-visible failures always carry the affected
/// key so callers can report what broke, not just why.
#[derive(Debug, Error)]
pub enum SomaError {
    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    #[error("transient I/O on {key}: {message}")]
    TransientIo { key: String, message: String },

    #[error("permission denied: {key}")]
    PermissionDenied { key: String },

    #[error("quota exceeded: {key}")]
    QuotaExceeded { key: String },

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("circuit open for {class} operations")]
    CircuitOpen { class: OpClass },

    #[error("overloaded: queue depth {queue_depth} at limit")]
    Overloaded { queue_depth: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("embedding failed: {0}")]
    EmbedFailed(String),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl SomaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SomaError::NotFound { .. } => ErrorKind::NotFound,
            SomaError::Conflict { .. } => ErrorKind::Conflict,
            SomaError::TransientIo { .. } => ErrorKind::TransientIo,
            SomaError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            SomaError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            SomaError::Invalid(_) => ErrorKind::Invalid,
            SomaError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            SomaError::Overloaded { .. } => ErrorKind::Overloaded,
            SomaError::Cancelled => ErrorKind::Cancelled,
            SomaError::EmbedFailed(_) => ErrorKind::EmbedFailed,
            SomaError::IndexUnavailable(_) => ErrorKind::IndexUnavailable,
            SomaError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Only transient I/O is ever retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SomaError::TransientIo { .. })
    }

    /// Failures that count against a circuit breaker. Lifecycle signals
    /// (circuit open, overloaded, cancelled) and plain absence do not.
    pub fn counts_as_circuit_failure(&self) -> bool {
        matches!(
            self,
            SomaError::TransientIo { .. }
                | SomaError::PermissionDenied { .. }
                | SomaError::QuotaExceeded { .. }
                | SomaError::Fatal(_)
        )
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        SomaError::NotFound { key: key.into() }
    }

    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SomaError::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(key: impl Into<String>, message: impl Into<String>) -> Self {
        SomaError::TransientIo {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        SomaError::Invalid(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SomaError::Fatal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SomaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::Invalid.exit_code(), 1);
        assert_eq!(ErrorKind::TransientIo.exit_code(), 2);
        assert_eq!(ErrorKind::CircuitOpen.exit_code(), 3);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 4);
        assert_eq!(ErrorKind::Fatal.exit_code(), 5);
    }

    #[test]
    fn test_retry_classification() {
        assert!(SomaError::transient("a/b", "reset").is_retryable());
        assert!(!SomaError::not_found("a/b").is_retryable());
        assert!(!SomaError::invalid("bad uuid").is_retryable());
    }

    #[test]
    fn test_circuit_classification() {
        assert!(SomaError::transient("k", "io").counts_as_circuit_failure());
        assert!(!SomaError::Cancelled.counts_as_circuit_failure());
        assert!(!SomaError::not_found("k").counts_as_circuit_failure());
    }
}
