//! Event emission host function.
//!
//! `emit(name, payload)` requires `events:emit:<name>` or `events:emit:*`.
//! Events are recorded for the host to dispatch; the engine never delivers
//! them itself.

use rquickjs::{Ctx, Function, Object};

use handler_runtime_core::SharedContext;
use handler_runtime_core::value::JsonValue;

use crate::registry::{begin_call, fail, ok};

/// Register the `events_emit` host function on the native object.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    shared: &SharedContext,
) -> rquickjs::Result<()> {
    let emit = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move |name: String, payload: JsonValue| {
            events_emit(&shared, name, payload.0)
        })?
    };
    native.set("events_emit", emit)?;
    Ok(())
}

fn events_emit(shared: &SharedContext, name: String, payload: serde_json::Value) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability(&format!("events:emit:{name}")) {
        return fail(&mut guard, e);
    }
    guard.record_event(name, payload);
    ok(serde_json::Value::Null)
}
