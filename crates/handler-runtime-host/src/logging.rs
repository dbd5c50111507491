//! Logging host function.
//!
//! Logging needs no capability. Entries are both:
//! 1. Stored in the execution context for the host to retrieve
//! 2. Mirrored through `tracing` for observability
//!
//! Log calls still count toward the host-call ceiling like every other
//! host function.

use rquickjs::{Ctx, Function, Object};
use tracing::{debug, error, info, warn};

use handler_runtime_core::value::JsonValue;
use handler_runtime_core::{LogLevel, SharedContext};

use crate::registry::{begin_call, fail, ok};

/// Register the `log_write` host function on the native object.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    shared: &SharedContext,
) -> rquickjs::Result<()> {
    let write = {
        let shared = shared.clone();
        Function::new(ctx.clone(), move |level: String, message: String| {
            log_write(&shared, &level, message)
        })?
    };
    native.set("log_write", write)?;
    Ok(())
}

fn log_write(shared: &SharedContext, level: &str, message: String) -> JsonValue {
    let mut guard = shared.lock();
    if let Err(e) = begin_call(&mut guard) {
        return fail(&mut guard, e);
    }

    let level = LogLevel::parse(level);
    let handler_id = guard.handler_id.clone();
    match level {
        LogLevel::Debug => debug!(handler_id, guest_log = true, "{}", message),
        LogLevel::Info => info!(handler_id, guest_log = true, "{}", message),
        LogLevel::Warn => warn!(handler_id, guest_log = true, "{}", message),
        LogLevel::Error => error!(handler_id, guest_log = true, "{}", message),
    }
    guard.record_log(level, message);
    ok(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{shared_with, unpack};
    use handler_runtime_core::ExtensionRegistry;

    #[test]
    fn test_log_requires_no_capability() {
        let shared = shared_with(&[], ExtensionRegistry::default(), 100);

        let (success, _) = unpack(log_write(&shared, "info", "hello".into()));
        assert!(success);
        let (success, _) = unpack(log_write(&shared, "error", "world".into()));
        assert!(success);

        let effects = shared.lock().drain_effects();
        assert_eq!(effects.logs.len(), 2);
        assert_eq!(effects.logs[0].level, LogLevel::Info);
        assert_eq!(effects.logs[0].message, "hello");
        assert_eq!(effects.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_unknown_level_defaults_to_info() {
        let shared = shared_with(&[], ExtensionRegistry::default(), 100);
        unpack(log_write(&shared, "verbose", "m".into()));

        let effects = shared.lock().drain_effects();
        assert_eq!(effects.logs[0].level, LogLevel::Info);
    }

    #[test]
    fn test_log_counts_toward_ceiling() {
        let shared = shared_with(&[], ExtensionRegistry::default(), 1);

        let (success, _) = unpack(log_write(&shared, "info", "first".into()));
        assert!(success);

        let (success, envelope) = unpack(log_write(&shared, "info", "second".into()));
        assert!(!success);
        assert_eq!(envelope["code"], "ResourceLimit");
    }
}
