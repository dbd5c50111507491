//! State host functions.
//!
//! Reads go through the request's snapshot overlaid with this run's own
//! mutations; writes only record mutations for the host to apply. Each
//! operation requires the matching capability:
//!
//! - `get` / `has`: `state:read:<key>` or `state:read:*`
//! - `set` / `delete`: `state:write:<key>` or `state:write:*`
//! - `keys`: `state:read:*` specifically, since enumerating every key is
//!   strictly more powerful than reading one

use rquickjs::{Ctx, Function, Object};

use handler_runtime_core::SharedContext;
use handler_runtime_core::value::JsonValue;

use crate::registry::{begin_call, fail, ok};

/// Register the `state_*` host functions on the native object.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    shared: &SharedContext,
) -> rquickjs::Result<()> {
    let get = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move |key: String| state_get(&shared, &key))?
    };
    native.set("state_get", get)?;

    let has = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move |key: String| state_has(&shared, &key))?
    };
    native.set("state_has", has)?;

    let set = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move |key: String, value: JsonValue| {
            state_set(&shared, key, value.0)
        })?
    };
    native.set("state_set", set)?;

    let delete = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move |key: String| state_delete(&shared, key))?
    };
    native.set("state_delete", delete)?;

    let keys = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move || state_keys(&shared))?
    };
    native.set("state_keys", keys)?;

    Ok(())
}

fn state_get(shared: &SharedContext, key: &str) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability(&format!("state:read:{key}")) {
        return fail(&mut guard, e);
    }
    ok(guard.state_get(key).unwrap_or(serde_json::Value::Null))
}

fn state_has(shared: &SharedContext, key: &str) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability(&format!("state:read:{key}")) {
        return fail(&mut guard, e);
    }
    ok(serde_json::Value::Bool(guard.state_has(key)))
}

fn state_set(shared: &SharedContext, key: String, value: serde_json::Value) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability(&format!("state:write:{key}")) {
        return fail(&mut guard, e);
    }
    guard.record_set(key, value);
    ok(serde_json::Value::Null)
}

fn state_delete(shared: &SharedContext, key: String) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability(&format!("state:write:{key}")) {
        return fail(&mut guard, e);
    }
    guard.record_delete(key);
    ok(serde_json::Value::Null)
}

fn state_keys(shared: &SharedContext) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability("state:read:*") {
        return fail(&mut guard, e);
    }
    let keys = guard
        .state_keys()
        .into_iter()
        .map(serde_json::Value::String)
        .collect();
    ok(serde_json::Value::Array(keys))
}
