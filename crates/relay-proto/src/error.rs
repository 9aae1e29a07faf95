//! Error taxonomy for the relay wire protocol.
//!
//! Errors are kinds, not exceptions: every failure surfaced to a peer is an
//! `ERROR` frame carrying one of these codes plus a human-readable message.
//! Categories mirror the retry contract a caller should honor; the relay
//! itself never retries on a caller's behalf.

use serde::{Deserialize, Serialize};

/// Error codes carried in `ERROR`/`REGISTERED{error}` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InstanceNotFound,
    InstanceReloading,
    InstanceBusy,
    InstanceDisconnected,
    CommandNotFound,
    InvalidParams,
    Timeout,
    InternalError,
    ProtocolError,
    MalformedJson,
    PayloadTooLarge,
    ProtocolVersionMismatch,
    CapabilityNotSupported,
    QueueFull,
    AmbiguousInstance,
}

impl ErrorCode {
    /// Transient codes a well-behaved client is expected to retry.
    /// The relay never retries these itself; they are never cached.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::InstanceReloading
                | ErrorCode::InstanceBusy
                | ErrorCode::Timeout
                | ErrorCode::QueueFull
                | ErrorCode::InstanceDisconnected
        )
    }

    /// Default human-readable message for a bare code.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::InstanceNotFound => "instance not found",
            ErrorCode::InstanceReloading => "instance is reloading",
            ErrorCode::InstanceBusy => "instance is busy",
            ErrorCode::InstanceDisconnected => "instance disconnected",
            ErrorCode::CommandNotFound => "command not found",
            ErrorCode::InvalidParams => "invalid params",
            ErrorCode::Timeout => "timed out",
            ErrorCode::InternalError => "internal error",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::MalformedJson => "malformed JSON payload",
            ErrorCode::PayloadTooLarge => "payload too large",
            ErrorCode::ProtocolVersionMismatch => "protocol version mismatch",
            ErrorCode::CapabilityNotSupported => "capability not supported",
            ErrorCode::QueueFull => "queue full",
            ErrorCode::AmbiguousInstance => "ambiguous instance",
        }
    }
}

/// `{code, message}` body carried inline in error-bearing frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an `ErrorInfo` from a bare code using its default message,
    /// mirroring the source protocol's `ErrorMessage.from_code` helper.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InstanceNotFound).unwrap();
        assert_eq!(json, "\"INSTANCE_NOT_FOUND\"");
    }

    #[test]
    fn transient_codes_are_retryable() {
        assert!(ErrorCode::InstanceBusy.is_retryable());
        assert!(ErrorCode::QueueFull.is_retryable());
        assert!(!ErrorCode::AmbiguousInstance.is_retryable());
        assert!(!ErrorCode::InternalError.is_retryable());
    }

    #[test]
    fn from_code_fills_default_message() {
        let info = ErrorInfo::from_code(ErrorCode::QueueFull);
        assert_eq!(info.code, ErrorCode::QueueFull);
        assert_eq!(info.message, "queue full");
    }
}
