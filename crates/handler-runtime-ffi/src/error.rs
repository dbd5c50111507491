//! FFI error codes and the thread-local last-error slot.
//!
//! In-run failures travel inside the serialized execution result; the
//! codes here cover engine-level failures where no result exists. The
//! last error message for the calling thread is retrievable through
//! [`handler_rt_last_error`].

use std::cell::RefCell;
use std::ffi::{CString, c_char};

use handler_runtime_common::EngineError;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Stable status codes returned by every FFI entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    /// Success; the output buffer is valid.
    Ok = 0,
    /// A pointer or argument was invalid.
    InvalidArgument = 1,
    /// Malformed data crossed the boundary.
    Serialization = 2,
    /// The handler source failed to compile (precompile path only).
    Compilation = 3,
    /// The suspension id is unknown or already consumed.
    SuspensionNotFound = 4,
    /// The engine is shutting down.
    ShuttingDown = 5,
    /// An engine invariant was violated.
    Internal = 6,
}

/// An engine-level failure crossing the FFI boundary.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FfiError {
    /// The stable status code.
    pub code: FfiErrorCode,
    /// Human-readable description, stored for `handler_rt_last_error`.
    pub message: String,
}

impl FfiError {
    /// Invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: FfiErrorCode::InvalidArgument,
            message: message.into(),
        }
    }
}

impl From<EngineError> for FfiError {
    fn from(error: EngineError) -> Self {
        let code = match &error {
            EngineError::Serialization { .. } => FfiErrorCode::Serialization,
            EngineError::Compilation { .. } => FfiErrorCode::Compilation,
            EngineError::SuspensionNotFound { .. } => FfiErrorCode::SuspensionNotFound,
            EngineError::ShuttingDown => FfiErrorCode::ShuttingDown,
            _ => FfiErrorCode::Internal,
        };
        Self {
            code,
            message: error.to_string(),
        }
    }
}

/// Record the error for the calling thread and return its code.
pub fn set_last_error(error: &FfiError) -> FfiErrorCode {
    let message = CString::new(error.message.clone())
        .unwrap_or_else(|_| c"invalid utf-8 error string".to_owned());
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(message);
    });
    error.code
}

/// Clear the last error for the calling thread.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

/// The last error message recorded on this thread, or null.
///
/// The pointer stays valid until the next FFI call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn handler_rt_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |message| message.as_ptr())
    })
}

/// Early-return an error code from an FFI entry point, recording the
/// message for `handler_rt_last_error`.
#[macro_export]
macro_rules! c_try {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => {
                let e: $crate::error::FfiError = e.into();
                return $crate::error::set_last_error(&e);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        let err: FfiError = EngineError::ShuttingDown.into();
        assert_eq!(err.code, FfiErrorCode::ShuttingDown);

        let err: FfiError = EngineError::SuspensionNotFound {
            suspension_id: "x".into(),
        }
        .into();
        assert_eq!(err.code, FfiErrorCode::SuspensionNotFound);

        let err: FfiError = EngineError::serialization("bad cbor").into();
        assert_eq!(err.code, FfiErrorCode::Serialization);

        let err: FfiError = EngineError::internal("invariant").into();
        assert_eq!(err.code, FfiErrorCode::Internal);
    }

    #[test]
    fn test_last_error_roundtrip() {
        clear_last_error();
        assert!(handler_rt_last_error().is_null());

        let error = FfiError::invalid_argument("null pointer");
        assert_eq!(set_last_error(&error), FfiErrorCode::InvalidArgument);

        let ptr = handler_rt_last_error();
        assert!(!ptr.is_null());
        let message = unsafe { std::ffi::CStr::from_ptr(ptr) };
        assert_eq!(message.to_str().unwrap(), "null pointer");
    }
}
