//! Error types for the strand runtime.
//!
//! Every failure carries a stable kind string (see [`Error::kind`]) so
//! callers and event consumers can branch on the category without parsing
//! messages. Tool-execution failures are deliberately *not* represented
//! here as propagated errors: the engine records them, emits them as
//! events, and folds them into tool-result blocks instead.

use thiserror::Error;

/// Runtime error with a stable kind.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid argument or schema mismatch.
    #[error("invalid input: {0}")]
    Input(String),

    /// Missing agent, template, tool, or room member.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id, member, or task.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Pool is at its agent limit.
    #[error("capacity: {0}")]
    Capacity(String),

    /// Denied by permission policy.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Tool, model stream, or approval wait exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Cancelled by the caller.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Model provider, sandbox, or store failure.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Invariant violated inside the runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Input(_) => "input",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Capacity(_) => "capacity",
            Error::Permission(_) => "permission",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Upstream(_) => "upstream",
            Error::Internal(_) => "internal",
        }
    }

    /// True if this error came from a cancelled context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::Input("x".into()).kind(), "input");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(Error::Capacity("x".into()).kind(), "capacity");
        assert_eq!(Error::Permission("x".into()).kind(), "permission");
        assert_eq!(Error::Timeout("x".into()).kind(), "timeout");
        assert_eq!(Error::Cancelled("x".into()).kind(), "cancelled");
        assert_eq!(Error::Upstream("x".into()).kind(), "upstream");
        assert_eq!(Error::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn display_includes_message() {
        let err = Error::NotFound("agent agt:123".into());
        assert_eq!(err.to_string(), "not found: agent agt:123");
    }
}
