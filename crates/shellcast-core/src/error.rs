// ABOUTME: Error taxonomy for the execution core and its JSON-RPC code mapping
// ABOUTME: ExecError covers request failures, ConfigError covers static validation

use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes used on the wire.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const RESOURCE_EXHAUSTED: i64 = -32001;
    pub const COMMAND_NOT_ALLOWED: i64 = -32002;
    pub const NOT_FOUND: i64 = -32003;
    pub const TIMED_OUT: i64 = -32004;
    pub const SESSION_BUSY: i64 = -32005;
    pub const HOOK_FAILED: i64 = -32006;
    pub const SPAWN_FAILED: i64 = -32007;
    pub const CANCELLED: i64 = -32008;
}

/// Failures surfaced to a client for a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("session limit reached ({active}/{max})")]
    ResourceExhausted { active: usize, max: usize },

    #[error("session {0} already has an execution in flight")]
    SessionBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pre-execution hook '{hook}' failed: {reason}")]
    HookFailed { hook: String, reason: String },

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Wire code only. A running process that times out ends with
    /// `CompletionStatus::TimedOut` in its result, never with this error.
    #[error("execution timed out after {0:?}")]
    TimedOut(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            ExecError::ResourceExhausted { .. } => codes::RESOURCE_EXHAUSTED,
            ExecError::SessionBusy(_) => codes::SESSION_BUSY,
            ExecError::NotFound(_) => codes::NOT_FOUND,
            ExecError::HookFailed { .. } => codes::HOOK_FAILED,
            ExecError::SpawnFailed(_) => codes::SPAWN_FAILED,
            ExecError::TimedOut(_) => codes::TIMED_OUT,
            ExecError::Cancelled => codes::CANCELLED,
            ExecError::ProtocolError(_) => codes::INVALID_REQUEST,
            ExecError::InvalidParams(_) => codes::INVALID_PARAMS,
            ExecError::CommandNotAllowed(_) => codes::COMMAND_NOT_ALLOWED,
            ExecError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Stable machine-readable name, sent as `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::ResourceExhausted { .. } => "ResourceExhausted",
            ExecError::SessionBusy(_) => "SessionBusy",
            ExecError::NotFound(_) => "NotFound",
            ExecError::HookFailed { .. } => "HookFailed",
            ExecError::SpawnFailed(_) => "SpawnFailed",
            ExecError::TimedOut(_) => "TimedOut",
            ExecError::Cancelled => "Cancelled",
            ExecError::ProtocolError(_) => "ProtocolError",
            ExecError::InvalidParams(_) => "InvalidParams",
            ExecError::CommandNotAllowed(_) => "CommandNotAllowed",
            ExecError::Internal(_) => "Internal",
        }
    }
}

/// Static configuration problems, reported once at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("invalid hook '{name}': {reason}")]
    InvalidHook { name: String, reason: String },

    #[error("duplicate hook name '{0}'")]
    DuplicateHook(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_kind() {
        let errors = [
            ExecError::ResourceExhausted { active: 1, max: 1 },
            ExecError::SessionBusy("s".into()),
            ExecError::NotFound("s".into()),
            ExecError::HookFailed {
                hook: "h".into(),
                reason: "r".into(),
            },
            ExecError::SpawnFailed("x".into()),
            ExecError::TimedOut(Duration::from_secs(1)),
            ExecError::Cancelled,
            ExecError::ProtocolError("p".into()),
            ExecError::InvalidParams("p".into()),
            ExecError::CommandNotAllowed("rm".into()),
            ExecError::Internal("i".into()),
        ];
        let mut seen: Vec<i64> = errors.iter().map(ExecError::code).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), errors.len());
    }

    #[test]
    fn hook_failure_message_names_the_hook() {
        let err = ExecError::HookFailed {
            hook: "setup_env".into(),
            reason: "exit code 3".into(),
        };
        assert_eq!(
            err.to_string(),
            "pre-execution hook 'setup_env' failed: exit code 3"
        );
        assert_eq!(err.kind(), "HookFailed");
    }
}
