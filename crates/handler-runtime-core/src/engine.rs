//! QuickJS runtime configuration and creation.
//!
//! The [`JsEngine`] is the factory for guest virtual machines. Every
//! runtime it creates carries:
//! - a per-instance memory ceiling
//! - a guest stack ceiling
//! - an interrupt hook wired to a per-run deadline flag, so timed-out
//!   executions abort instead of spinning

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rquickjs::Runtime;
use tracing::debug;

use handler_runtime_common::{EngineConfig, EngineError};

/// Factory for configured guest runtimes.
///
/// The engine holds no per-request state; it only carries the limits every
/// instance is created with. Cloning is cheap and instances created from
/// clones are indistinguishable.
#[derive(Clone)]
pub struct JsEngine {
    config: EngineConfig,
}

impl JsEngine {
    /// Create a new engine factory with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured limits are unusable.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        if config.instance_memory_mb == 0 {
            return Err(EngineError::invalid_config(
                "instance_memory_mb must be greater than zero",
            ));
        }
        if config.max_stack_kb == 0 {
            return Err(EngineError::invalid_config(
                "max_stack_kb must be greater than zero",
            ));
        }

        Ok(Self {
            config: config.clone(),
        })
    }

    /// Create one guest runtime plus its interrupt flag.
    ///
    /// The flag starts cleared; setting it makes the runtime abort the
    /// current execution at the next interrupt check.
    pub fn create_runtime(&self) -> Result<(Runtime, Arc<AtomicBool>), EngineError> {
        let runtime = Runtime::new()
            .map_err(|e| EngineError::internal(format!("failed to create guest runtime: {e}")))?;

        runtime.set_memory_limit(self.config.memory_limit_bytes());
        runtime.set_max_stack_size(self.config.stack_limit_bytes());

        let flag = Arc::new(AtomicBool::new(false));
        let hook = Arc::clone(&flag);
        runtime.set_interrupt_handler(Some(Box::new(move || hook.load(Ordering::Relaxed))));

        debug!(
            memory_limit_mb = self.config.instance_memory_mb,
            stack_kb = self.config.max_stack_kb,
            "Guest runtime created"
        );

        Ok((runtime, flag))
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether guest stacks are exposed in error results.
    pub fn debug_enabled(&self) -> bool {
        self.config.debug
    }
}

impl std::fmt::Debug for JsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsEngine")
            .field("instance_memory_mb", &self.config.instance_memory_mb)
            .field("max_stack_kb", &self.config.max_stack_kb)
            .field("debug", &self.config.debug)
            .finish_non_exhaustive()
    }
}
