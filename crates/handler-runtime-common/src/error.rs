//! Error types for handler-runtime.
//!
//! This module defines the engine error hierarchy using `thiserror`.
//! [`EngineError`] covers everything from compilation through execution;
//! each variant maps to a stable wire code via [`EngineError::code`] so the
//! FFI boundary can expose a fixed vocabulary to host applications.

use std::io;

use thiserror::Error;

/// Which resource ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// The per-execution host-call ceiling.
    HostCalls,
    /// The per-instance memory limit.
    Memory,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::HostCalls => write!(f, "host calls"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Top-level engine errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// executing handler scripts, from compilation to suspension handling.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Handler source failed to compile.
    #[error("Compilation failed: {message}")]
    Compilation {
        /// Description of the compilation failure.
        message: String,
        /// Source line where the failure was reported, if known.
        line: Option<u32>,
        /// Source column where the failure was reported, if known.
        column: Option<u32>,
    },

    /// A host function call was not covered by the granted capabilities.
    #[error("Permission denied: missing capability `{capability}`")]
    PermissionDenied {
        /// The capability string that would have allowed the call.
        capability: String,
    },

    /// A configured resource ceiling was exceeded.
    #[error("Resource limit exceeded ({kind}): {message}")]
    ResourceLimit {
        /// Which ceiling was hit.
        kind: ResourceKind,
        /// Description of the limit violation.
        message: String,
    },

    /// Execution exceeded the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The requested extension is not present in the request's registry.
    #[error("Extension not found: {extension}")]
    ExtensionNotFound {
        /// Name of the missing extension.
        extension: String,
    },

    /// The extension exists but does not expose the requested method.
    #[error("Method not found: {extension}.{method}")]
    MethodNotFound {
        /// Extension name.
        extension: String,
        /// Requested method name.
        method: String,
    },

    /// The suspension id is unknown or was already consumed.
    #[error("Suspension not found: {suspension_id}")]
    SuspensionNotFound {
        /// The stale or unknown suspension id.
        suspension_id: String,
    },

    /// Malformed data crossed the engine boundary.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The guest threw an exception the handler did not catch.
    #[error("Handler trap: {message}")]
    Trap {
        /// The guest exception message.
        message: String,
        /// Guest stack trace, when captured.
        stack: Option<String>,
    },

    /// An engine invariant was violated.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the invariant violation.
        message: String,
    },

    /// The engine is shutting down and rejects new work.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed (bytecode cache disk tier).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Create a new `Compilation` error without location information.
    pub fn compilation(message: impl Into<String>) -> Self {
        Self::Compilation {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Create a new `PermissionDenied` error.
    pub fn permission_denied(capability: impl Into<String>) -> Self {
        Self::PermissionDenied {
            capability: capability.into(),
        }
    }

    /// Create a new `ResourceLimit` error.
    pub fn resource_limit(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self::ResourceLimit {
            kind,
            message: message.into(),
        }
    }

    /// Create a new `Trap` error without a stack.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
            stack: None,
        }
    }

    /// Create a new `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a new `Serialization` error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Stable code string exposed on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compilation { .. } => "CompilationError",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::ResourceLimit { .. } => "ResourceLimit",
            Self::Timeout { .. } => "Timeout",
            Self::ExtensionNotFound { .. } => "ExtensionNotFound",
            Self::MethodNotFound { .. } => "MethodNotFound",
            Self::SuspensionNotFound { .. } => "SuspensionNotFound",
            Self::Serialization { .. } => "SerializationError",
            Self::Trap { .. } => "Trap",
            Self::Internal { .. } => "InternalError",
            Self::ShuttingDown => "ShuttingDown",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::Io(_) => "IoError",
        }
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::ResourceLimit { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if this error should terminate the instance that
    /// produced it instead of returning it to the idle pool.
    ///
    /// Timeouts leave the VM in an unknown state mid-interrupt, and
    /// invariant violations mean the instance can no longer be trusted.
    pub fn is_terminal_for_instance(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Internal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::permission_denied("state:read:other");
        assert_eq!(
            err.to_string(),
            "Permission denied: missing capability `state:read:other`"
        );

        let err = EngineError::Timeout { duration_ms: 250 };
        assert_eq!(err.to_string(), "Execution timeout after 250ms");
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(EngineError::compilation("x").code(), "CompilationError");
        assert_eq!(
            EngineError::permission_denied("events:emit:save").code(),
            "PermissionDenied"
        );
        assert_eq!(
            EngineError::resource_limit(ResourceKind::HostCalls, "ceiling").code(),
            "ResourceLimit"
        );
        assert_eq!(EngineError::trap("boom").code(), "Trap");
        assert_eq!(EngineError::ShuttingDown.code(), "ShuttingDown");
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(
            EngineError::resource_limit(ResourceKind::Memory, "over limit").is_resource_limit()
        );
        assert!(EngineError::Timeout { duration_ms: 10 }.is_resource_limit());
        assert!(!EngineError::trap("x").is_resource_limit());
    }

    #[test]
    fn test_terminal_for_instance() {
        assert!(EngineError::Timeout { duration_ms: 1 }.is_terminal_for_instance());
        assert!(EngineError::internal("bad state").is_terminal_for_instance());
        assert!(!EngineError::permission_denied("ext:http").is_terminal_for_instance());
        assert!(!EngineError::trap("boom").is_terminal_for_instance());
    }
}
