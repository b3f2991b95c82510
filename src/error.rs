//! Failure taxonomy for the harness.
//!
//! Components surface these as typed results or events; only the
//! orchestrator turns them into a verification verdict.

use std::io;

/// Errors raised by harness components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to launch process '{tag}': {reason}")]
    LaunchFailed { tag: String, reason: String },

    #[error("failed to send {what}: connection not ready")]
    SendFailed { what: String },

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("process '{tag}' exited unexpectedly (exit code {exit_code:?})")]
    UnexpectedProcessExit { tag: String, exit_code: Option<i32> },

    #[error("process '{tag}' exited as expected (exit code {exit_code:?})")]
    ExpectedProcessExit { tag: String, exit_code: Option<i32> },

    #[error("timeout expired ({reason})")]
    TimeoutExpired { reason: String },

    #[error("unit test settings invalid: {0}")]
    ValidationFailed(String),

    #[error("process suspend/resume is unsupported on this platform")]
    SuspendUnsupported,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl HarnessError {
    /// Whether the failure leaves the test able to continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SendFailed { .. } | Self::NetworkFailure(_) | Self::ExpectedProcessExit { .. }
        )
    }

    /// Whether the failure ends the test regardless of declared policy.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailed { .. } | Self::ValidationFailed(_) | Self::ProtocolViolation(_)
        )
    }
}

/// Errors from encoding or decoding channel frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown control command kind {0}")]
    UnknownCommand(u8),

    #[error("unknown channel message type {0}")]
    UnknownMessageType(u8),

    #[error("invalid string payload: {0}")]
    InvalidString(String),

    #[error("frame of {0} bytes exceeds the channel limit")]
    FrameTooLarge(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from sampling system memory.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("failed to read /proc/meminfo: {0}")]
    Read(#[from] io::Error),

    #[error("/proc/meminfo lacks '{0}'")]
    MissingField(&'static str),
}
