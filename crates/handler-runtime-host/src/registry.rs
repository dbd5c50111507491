//! Host function registration for guest executions.
//!
//! This module assembles the `__native` object every compiled handler
//! module is bound to. Each property is one host function; the compiled
//! module's shim destructures them into the `state`/`events`/`view`/`log`/
//! `ext` API the handler source sees.
//!
//! Host functions are data-in/data-out: they take plain values, return an
//! envelope (`{k: "ok", v}` or `{k: "err", code, message}`), and the shim
//! converts error envelopes into thrown guest exceptions carrying the
//! stable `code`. The typed error is recorded on the execution context so
//! an uncaught rejection surfaces with full fidelity.

use std::sync::Arc;

use rquickjs::{Ctx, Object};
use serde_json::json;

use handler_runtime_common::{EngineError, RuntimeConfig};
use handler_runtime_core::value::JsonValue;
use handler_runtime_core::{ExecutionContext, HandlerRuntime, HostBinder, SharedContext};

use crate::{events, extension, logging, state, view};

/// Build the `__native` host object for one execution.
///
/// Registers every host function family against the shared execution
/// context:
/// - `state_*` (capability-gated reads and mutation recording)
/// - `events_emit`
/// - `view_update`
/// - `log_write` (always permitted)
/// - `ext_call` (suspension issuance)
pub fn install_native<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedContext,
) -> rquickjs::Result<Object<'js>> {
    let native = Object::new(ctx.clone())?;
    state::register(ctx, &native, shared)?;
    events::register(ctx, &native, shared)?;
    view::register(ctx, &native, shared)?;
    logging::register(ctx, &native, shared)?;
    extension::register(ctx, &native, shared)?;
    Ok(native)
}

/// The standard host binder: installs every host function family.
pub fn host_binder() -> HostBinder {
    Arc::new(install_native)
}

/// Create a [`HandlerRuntime`] wired with the standard host functions.
pub fn create_runtime(config: RuntimeConfig) -> Result<HandlerRuntime, EngineError> {
    HandlerRuntime::new(config, host_binder())
}

/// Success envelope.
pub(crate) fn ok(value: serde_json::Value) -> JsonValue {
    JsonValue(json!({ "k": "ok", "v": value }))
}

/// Error envelope; records the typed error on the context so an uncaught
/// rejection can be mapped back to it.
pub(crate) fn fail(context: &mut ExecutionContext, error: EngineError) -> JsonValue {
    let envelope = JsonValue(json!({
        "k": "err",
        "code": error.code(),
        "message": error.to_string(),
    }));
    context.host_error = Some(error);
    envelope
}

/// Entry bookkeeping shared by every host function: clear any stale typed
/// error from a caught earlier failure, then count the call against the
/// ceiling.
pub(crate) fn begin_call(context: &mut ExecutionContext) -> Result<(), EngineError> {
    context.host_error = None;
    context.count_host_call()
}


#[cfg(test)]
mod tests {
    use super::test_support::{shared_with, unpack};
    use super::*;
    use handler_runtime_core::ExtensionRegistry;

    #[test]
    fn test_envelopes() {
        let shared = shared_with(&[], ExtensionRegistry::default(), 10);
        let mut guard = shared.lock();

        let (success, payload) = unpack(ok(json!(42)));
        assert!(success);
        assert_eq!(payload, json!(42));

        let (success, payload) = unpack(fail(
            &mut guard,
            EngineError::permission_denied("state:read:x"),
        ));
        assert!(!success);
        assert_eq!(payload["code"], "PermissionDenied");
        assert!(guard.host_error.is_some());
    }

    #[test]
    fn test_begin_call_clears_stale_host_error() {
        let shared = shared_with(&[], ExtensionRegistry::default(), 10);
        let mut guard = shared.lock();

        guard.host_error = Some(EngineError::permission_denied("ext:http"));
        begin_call(&mut guard).unwrap();
        assert!(guard.host_error.is_none());
        assert_eq!(guard.host_calls(), 1);
    }

    #[test]
    fn test_begin_call_enforces_ceiling() {
        let shared = shared_with(&[], ExtensionRegistry::default(), 1);
        let mut guard = shared.lock();

        begin_call(&mut guard).unwrap();
        let err = begin_call(&mut guard).unwrap_err();
        assert!(matches!(err, EngineError::ResourceLimit { .. }));
    }
}
