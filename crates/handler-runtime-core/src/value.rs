//! Value conversion at the guest boundary.
//!
//! The engine's internal value model is `serde_json::Value` (with ordered
//! maps via the `preserve_order` feature). This module converts between
//! that model and QuickJS values, copy-based in both directions: guest
//! values never escape the VM and host values never leak references into
//! it.
//!
//! Conversions are depth-limited so cyclic or adversarially deep guest
//! structures fail with a serialization error instead of exhausting the
//! stack.

use rquickjs::{Array, Ctx, FromJs, IntoJs, Object, Type, Value};

use handler_runtime_common::EngineError;

/// Maximum nesting depth accepted in either direction.
pub const MAX_VALUE_DEPTH: usize = 64;

/// Convert a JSON value into a QuickJS value.
pub fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    json_to_js_inner(ctx, value, 0)
}

fn json_to_js_inner<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
    depth: usize,
) -> rquickjs::Result<Value<'js>> {
    if depth > MAX_VALUE_DEPTH {
        return Err(rquickjs::Error::new_into_js("json", "js value"));
    }

    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => (*b).into_js(ctx),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    small.into_js(ctx)
                } else {
                    (i as f64).into_js(ctx)
                }
            } else {
                n.as_f64().unwrap_or(f64::NAN).into_js(ctx)
            }
        }
        serde_json::Value::String(s) => s.as_str().into_js(ctx),
        serde_json::Value::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, json_to_js_inner(ctx, item, depth + 1)?)?;
            }
            Ok(array.into_value())
        }
        serde_json::Value::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), json_to_js_inner(ctx, item, depth + 1)?)?;
            }
            Ok(object.into_value())
        }
    }
}

/// Convert a QuickJS value into a JSON value.
///
/// Functions, symbols and other non-data types are rejected: the boundary
/// only carries plain data.
pub fn js_to_json(value: &Value<'_>) -> Result<serde_json::Value, EngineError> {
    js_to_json_inner(value, 0)
}

fn js_to_json_inner(value: &Value<'_>, depth: usize) -> Result<serde_json::Value, EngineError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(EngineError::serialization(format!(
            "value nesting exceeds {MAX_VALUE_DEPTH} levels"
        )));
    }

    match value.type_of() {
        Type::Undefined | Type::Null | Type::Uninitialized => Ok(serde_json::Value::Null),
        Type::Bool => Ok(serde_json::Value::Bool(value.as_bool().unwrap_or(false))),
        Type::Int => Ok(serde_json::Value::from(value.as_int().unwrap_or(0))),
        Type::Float => {
            let f = value.as_float().unwrap_or(0.0);
            serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    EngineError::serialization("non-finite number cannot cross the boundary")
                })
        }
        Type::String => {
            let s = value
                .as_string()
                .ok_or_else(|| EngineError::serialization("invalid string value"))?
                .to_string()
                .map_err(|e| EngineError::serialization(format!("invalid utf-8 string: {e}")))?;
            Ok(serde_json::Value::String(s))
        }
        Type::Array => {
            let array = value
                .as_array()
                .ok_or_else(|| EngineError::serialization("invalid array value"))?;
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<Value>() {
                let item =
                    item.map_err(|e| EngineError::serialization(format!("array element: {e}")))?;
                items.push(js_to_json_inner(&item, depth + 1)?);
            }
            Ok(serde_json::Value::Array(items))
        }
        Type::Object => {
            let object = value
                .as_object()
                .ok_or_else(|| EngineError::serialization("invalid object value"))?;
            let mut map = serde_json::Map::new();
            for prop in object.props::<String, Value>() {
                let (key, item) = prop
                    .map_err(|e| EngineError::serialization(format!("object property: {e}")))?;
                map.insert(key, js_to_json_inner(&item, depth + 1)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        other => Err(EngineError::serialization(format!(
            "unsupported value type at the boundary: {other:?}"
        ))),
    }
}

/// Newtype adapter so host functions can take and return JSON values as
/// plain closure parameters without touching QuickJS lifetimes.
#[derive(Debug, Clone)]
pub struct JsonValue(pub serde_json::Value);

impl<'js> FromJs<'js> for JsonValue {
    fn from_js(_ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        js_to_json(&value)
            .map(Self)
            .map_err(|_| rquickjs::Error::new_from_js("value", "json"))
    }
}

impl<'js> IntoJs<'js> for JsonValue {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        json_to_js(ctx, &self.0)
    }
}

/// Pull message, stack and the stable error code off a thrown guest value.
///
/// Plain (non-object) throws coerce to their display string.
pub fn exception_parts(value: &Value<'_>) -> (String, Option<String>, Option<String>) {
    if let Some(object) = value.as_object() {
        let message = object
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .unwrap_or_else(|| "unknown error".to_string());
        let stack = object.get::<_, Option<String>>("stack").ok().flatten();
        let code = object.get::<_, Option<String>>("code").ok().flatten();
        (message, stack, code)
    } else if let Some(s) = value.as_string() {
        let message = s
            .to_string()
            .unwrap_or_else(|_| "unknown error".to_string());
        (message, None, None)
    } else {
        ("unknown error".to_string(), None, None)
    }
}

/// Best-effort source location from a QuickJS stack trace.
///
/// QuickJS frames look like `    at <anonymous> (handler:12:3)`; the first
/// frame with a parseable `file:line[:column]` suffix wins.
pub fn parse_stack_location(stack: &str) -> Option<(u32, Option<u32>)> {
    for frame in stack.lines() {
        let inner = frame
            .rsplit_once('(')
            .map(|(_, rest)| rest.trim_end_matches(')'))
            .unwrap_or_else(|| frame.trim().trim_start_matches("at ").trim());

        // rsplitn yields segments right-to-left: [column, line, file] for
        // the three-part form, [line, file] for the two-part form.
        let segments: Vec<&str> = inner.rsplitn(3, ':').collect();
        if segments.len() == 3 {
            if let (Ok(column), Ok(line)) =
                (segments[0].parse::<u32>(), segments[1].parse::<u32>())
            {
                return Some((line, Some(column)));
            }
        }
        if segments.len() == 2 {
            if let Ok(line) = segments[0].parse::<u32>() {
                return Some((line, None));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_ctx<R>(f: impl FnOnce(&Ctx<'_>) -> R) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| f(&ctx))
    }

    #[test]
    fn test_roundtrip_scalars() {
        with_ctx(|ctx| {
            for value in [
                json!(null),
                json!(true),
                json!(42),
                json!(-7),
                json!(1.5),
                json!("hello"),
            ] {
                let js = json_to_js(ctx, &value).unwrap();
                assert_eq!(js_to_json(&js).unwrap(), value);
            }
        });
    }

    #[test]
    fn test_roundtrip_nested() {
        with_ctx(|ctx| {
            let value = json!({
                "items": [1, 2, {"name": "a"}],
                "meta": {"count": 3, "tags": ["x", "y"]}
            });
            let js = json_to_js(ctx, &value).unwrap();
            assert_eq!(js_to_json(&js).unwrap(), value);
        });
    }

    #[test]
    fn test_object_key_order_preserved() {
        with_ctx(|ctx| {
            let value = json!({"zebra": 1, "apple": 2, "mango": 3});
            let js = json_to_js(ctx, &value).unwrap();
            let back = js_to_json(&js).unwrap();
            let keys: Vec<_> = back.as_object().unwrap().keys().cloned().collect();
            assert_eq!(keys, ["zebra", "apple", "mango"]);
        });
    }

    #[test]
    fn test_guest_function_rejected() {
        with_ctx(|ctx| {
            let js: Value = ctx.eval("(function() {})").unwrap();
            let result = js_to_json(&js);
            assert!(matches!(result, Err(EngineError::Serialization { .. })));
        });
    }

    #[test]
    fn test_non_finite_rejected() {
        with_ctx(|ctx| {
            let js: Value = ctx.eval("1/0").unwrap();
            assert!(js_to_json(&js).is_err());
        });
    }

    #[test]
    fn test_depth_limit() {
        with_ctx(|ctx| {
            let js: Value = ctx
                .eval("(() => { let v = 0; for (let i = 0; i < 100; i++) v = [v]; return v; })()")
                .unwrap();
            assert!(js_to_json(&js).is_err());
        });
    }

    #[test]
    fn test_exception_parts() {
        with_ctx(|ctx| {
            let js: Value = ctx
                .eval("(() => { const e = new Error('boom'); e.code = 'PermissionDenied'; return e; })()")
                .unwrap();
            let (message, stack, code) = exception_parts(&js);
            assert_eq!(message, "boom");
            assert!(stack.is_some());
            assert_eq!(code.as_deref(), Some("PermissionDenied"));

            let js: Value = ctx.eval("'plain string throw'").unwrap();
            let (message, stack, code) = exception_parts(&js);
            assert_eq!(message, "plain string throw");
            assert!(stack.is_none());
            assert!(code.is_none());
        });
    }

    #[test]
    fn test_parse_stack_location() {
        let stack = "    at handler (handler:12:5)\n    at <eval> (handler:20:1)";
        assert_eq!(parse_stack_location(stack), Some((12, Some(5))));

        assert_eq!(parse_stack_location("no location here"), None);
    }
}
