//! View command host function.
//!
//! `update(component, command, params)` requires `view:update:<id>` or
//! `view:update:*`. Commands are advisory instructions for the host's
//! renderer; the engine records them and nothing more.

use rquickjs::{Ctx, Function, Object};

use handler_runtime_core::SharedContext;
use handler_runtime_core::value::JsonValue;

use crate::registry::{begin_call, fail, ok};

/// Register the `view_update` host function on the native object.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    shared: &SharedContext,
) -> rquickjs::Result<()> {
    let update = {
        let shared = shared.clone();
        Function::new(
            ctx.clone(),
            move |component: String, command: String, params: JsonValue| {
                view_update(&shared, component, command, params.0)
            },
        )?
    };
    native.set("view_update", update)?;
    Ok(())
}

fn view_update(
    shared: &SharedContext,
    component: String,
    command: String,
    params: serde_json::Value,
) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }
    if let Err(e) = guard.check_capability(&format!("view:update:{component}")) {
        return fail(&mut guard, e);
    }
    guard.record_command(component, command, params);
    ok(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{shared_with, unpack};
    use handler_runtime_core::ExtensionRegistry;
    use serde_json::json;

    #[test]
    fn test_update_with_component_grant() {
        let shared = shared_with(&["view:update:chart-1"], ExtensionRegistry::default(), 100);

        let (success, _) = unpack(view_update(
            &shared,
            "chart-1".into(),
            "setData".into(),
            json!([1, 2, 3]),
        ));
        assert!(success);

        let effects = shared.lock().drain_effects();
        assert_eq!(effects.commands.len(), 1);
        assert_eq!(effects.commands[0].component, "chart-1");
        assert_eq!(effects.commands[0].command, "setData");
    }

    #[test]
    fn test_update_denied_for_other_component() {
        let shared = shared_with(&["view:update:chart-1"], ExtensionRegistry::default(), 100);

        let (success, envelope) = unpack(view_update(
            &shared,
            "table-2".into(),
            "refresh".into(),
            json!(null),
        ));
        assert!(!success);
        assert_eq!(envelope["code"], "PermissionDenied");
        assert!(shared.lock().drain_effects().commands.is_empty());
    }
}
