//! Extension host function: the suspend side of the suspend/resume
//! protocol.
//!
//! `ext_call(name, method, args)` validates the extension and method
//! against the request's registry, requires `ext:<name>` (or `ext:*`),
//! records the single pending [`SuspensionState`] and returns its id. The
//! compiled module's shim parks a promise on that id; the host performs
//! the actual asynchronous operation outside the sandbox and delivers the
//! outcome through `resume`.

use rquickjs::{Ctx, Function, Object};
use uuid::Uuid;

use handler_runtime_core::value::JsonValue;
use handler_runtime_core::{SharedContext, SuspensionState};

use handler_runtime_common::EngineError;

use crate::registry::{begin_call, fail, ok};

/// Register the `ext_call` host function on the native object.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    shared: &SharedContext,
) -> rquickjs::Result<()> {
    let call = {
        let shared = shared.clone();
        Function::new(
            ctx.clone(),
            move |name: String, method: String, args: JsonValue| {
                ext_call(&shared, name, method, args.0)
            },
        )?
    };
    native.set("ext_call", call)?;
    Ok(())
}

fn ext_call(
    shared: &SharedContext,
    name: String,
    method: String,
    args: serde_json::Value,
) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }

    if guard.extensions().get(&name).is_none() {
        let error = EngineError::ExtensionNotFound { extension: name };
        return fail(&mut guard, error);
    }
    if !guard.extensions().has_method(&name, &method) {
        let error = EngineError::MethodNotFound {
            extension: name,
            method,
        };
        return fail(&mut guard, error);
    }
    if let Err(e) = guard.check_capability(&format!("ext:{name}")) {
        return fail(&mut guard, e);
    }

    let args = match args {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let suspension = SuspensionState {
        id: Uuid::new_v4().to_string(),
        extension: name,
        method,
        args,
    };
    let id = suspension.id.clone();

    if let Err(e) = guard.set_suspension(suspension) {
        return fail(&mut guard, e);
    }
    ok(serde_json::json!({ "id": id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{shared_with, unpack};
    use handler_runtime_core::ExtensionRegistry;
    use serde_json::json;

    fn http_registry() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::default();
        registry.register("http", ["get", "post"]);
        registry
    }

    #[test]
    fn test_call_records_suspension() {
        let shared = shared_with(&["ext:http"], http_registry(), 100);

        let (success, value) = unpack(ext_call(
            &shared,
            "http".into(),
            "get".into(),
            json!(["https://example.com"]),
        ));
        assert!(success);
        assert!(value["id"].as_str().is_some());

        let suspension = shared.lock().take_suspension().unwrap();
        assert_eq!(suspension.id, value["id"].as_str().unwrap());
        assert_eq!(suspension.extension, "http");
        assert_eq!(suspension.method, "get");
        assert_eq!(suspension.args, vec![json!("https://example.com")]);
    }

    #[test]
    fn test_unknown_extension() {
        let shared = shared_with(&["ext:*"], http_registry(), 100);

        let (success, envelope) = unpack(ext_call(&shared, "kv".into(), "get".into(), json!([])));
        assert!(!success);
        assert_eq!(envelope["code"], "ExtensionNotFound");
    }

    #[test]
    fn test_unknown_method() {
        let shared = shared_with(&["ext:*"], http_registry(), 100);

        let (success, envelope) =
            unpack(ext_call(&shared, "http".into(), "put".into(), json!([])));
        assert!(!success);
        assert_eq!(envelope["code"], "MethodNotFound");
    }

    #[test]
    fn test_capability_required() {
        let shared = shared_with(&[], http_registry(), 100);

        let (success, envelope) =
            unpack(ext_call(&shared, "http".into(), "get".into(), json!([])));
        assert!(!success);
        assert_eq!(envelope["code"], "PermissionDenied");
        assert!(
            envelope["message"]
                .as_str()
                .unwrap()
                .contains("ext:http")
        );
        assert!(shared.lock().take_suspension().is_none());
    }

    #[test]
    fn test_second_pending_call_is_internal_error() {
        let shared = shared_with(&["ext:*"], http_registry(), 100);

        let (success, _) = unpack(ext_call(&shared, "http".into(), "get".into(), json!([])));
        assert!(success);

        let (success, envelope) =
            unpack(ext_call(&shared, "http".into(), "get".into(), json!([])));
        assert!(!success);
        assert_eq!(envelope["code"], "InternalError");
    }

    #[test]
    fn test_ids_are_unique() {
        let shared = shared_with(&["ext:*"], http_registry(), 100);

        let (_, first) = unpack(ext_call(&shared, "http".into(), "get".into(), json!([])));
        shared.lock().take_suspension();
        let (_, second) = unpack(ext_call(&shared, "http".into(), "get".into(), json!([])));

        assert_ne!(first["id"], second["id"]);
    }
}
