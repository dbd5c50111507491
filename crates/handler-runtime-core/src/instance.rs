//! Guest VM instance lifecycle and the suspend/resume protocol.
//!
//! An [`Instance`] owns one QuickJS runtime and is bound to at most one
//! execution at a time. Each run gets a fresh guest context; releasing an
//! instance drops the context, which is what resets guest-visible state.
//!
//! Suspension works without coroutine primitives: the compiled module wraps
//! the handler in an `async` function, and an extension call parks a
//! promise whose resolvers live inside the VM. A pending top-level promise
//! plus a recorded [`SuspensionState`] *is* the suspended state: the guest
//! stack is preserved by the VM in the pending async frame. `resume`
//! re-enters through the module's `__resume` export and re-classifies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rquickjs::promise::PromiseState;
use rquickjs::{Context, Ctx, Function, Module, Object, Persistent, Promise, Runtime, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use handler_runtime_common::{EngineError, ResourceKind};

use crate::context::{ExecutionContext, SharedContext, SuspensionState};
use crate::engine::JsEngine;
use crate::value::{exception_parts, js_to_json, json_to_js};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Builds the `__native` host object for one execution.
///
/// The host crate supplies this; the core stays free of any knowledge of
/// individual host function families.
pub type HostBinder =
    Arc<dyn for<'js> Fn(&Ctx<'js>, &SharedContext) -> rquickjs::Result<Object<'js>> + Send + Sync>;

/// Result of an asynchronous host operation, delivered on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncCallResult {
    /// Whether the host operation succeeded.
    pub success: bool,
    /// Payload on success; error details (`message`, optional `code`) on
    /// failure.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl AsyncCallResult {
    /// A successful result carrying a payload.
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            success: true,
            value,
        }
    }

    /// A failed result carrying an error message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: serde_json::json!({ "message": message.into() }),
        }
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// In the pool, reusable.
    Idle,
    /// Bound to one in-flight execution.
    Active,
    /// Paused awaiting an async result, keyed by suspension id.
    Suspended,
    /// Destroyed; never reused.
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Idle => write!(f, "idle"),
            InstanceState::Active => write!(f, "active"),
            InstanceState::Suspended => write!(f, "suspended"),
            InstanceState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Outcome of one VM segment (a `begin` or a `resume`).
#[derive(Debug)]
pub enum RunOutcome {
    /// The handler returned.
    Completed { value: serde_json::Value },
    /// The handler is awaiting an extension result.
    Suspended { suspension: SuspensionState },
    /// The segment failed.
    Failed { error: EngineError },
}

/// VM state persisted across a suspension.
struct PendingRun {
    promise: Persistent<Promise<'static>>,
    namespace: Persistent<Object<'static>>,
}

/// One guest virtual machine, bound to at most one execution at a time.
pub struct Instance {
    id: u64,
    runtime: Runtime,
    context: Option<Context>,
    interrupt: Arc<AtomicBool>,
    state: InstanceState,
    binder: HostBinder,
    shared: Option<SharedContext>,
    pending: Option<PendingRun>,
    suspension_id: Option<String>,
    memory_high_water: u64,
}

impl Instance {
    /// Create a new idle instance.
    pub fn new(engine: &JsEngine, binder: HostBinder) -> Result<Self, EngineError> {
        let (runtime, interrupt) = engine.create_runtime()?;
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(instance_id = id, "Instance created");
        Ok(Self {
            id,
            runtime,
            context: None,
            interrupt,
            state: InstanceState::Idle,
            binder,
            shared: None,
            pending: None,
            suspension_id: None,
            memory_high_water: 0,
        })
    }

    /// Instance identifier, for tracing.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Flag that aborts the current run when set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Guest memory high-water mark observed for the current run.
    pub fn memory_high_water(&self) -> u64 {
        self.memory_high_water
    }

    /// Access the execution context of the current run.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> Option<R> {
        self.shared.as_ref().map(|shared| f(&mut shared.lock()))
    }

    /// Start executing compiled bytecode against a fresh context.
    ///
    /// The instance must be Idle. The call runs the guest synchronously
    /// until it completes, suspends, or fails; callers drive it from a
    /// blocking task.
    #[allow(unsafe_code)]
    #[instrument(skip(self, bytecode, context), fields(instance_id = self.id, handler_id = %context.handler_id))]
    pub fn begin(
        &mut self,
        bytecode: &[u8],
        context: ExecutionContext,
    ) -> Result<RunOutcome, EngineError> {
        if self.state != InstanceState::Idle {
            return Err(EngineError::internal(format!(
                "instance {} cannot start a run while {}",
                self.id, self.state
            )));
        }

        self.interrupt.store(false, Ordering::Relaxed);
        self.memory_high_water = 0;

        let js_context = Context::full(&self.runtime)
            .map_err(|e| EngineError::internal(format!("failed to create guest context: {e}")))?;
        let shared: SharedContext = Arc::new(Mutex::new(context));

        self.state = InstanceState::Active;
        self.shared = Some(Arc::clone(&shared));

        let binder = Arc::clone(&self.binder);
        let mut pending_slot: Option<PendingRun> = None;

        let setup: Result<(), EngineError> = js_context.with(|ctx| {
            // SAFETY: the bytecode comes from this engine's own compiler or
            // from a precompiled artifact the host obtained from it; the
            // cache key covers the format version.
            let module = unsafe { Module::load(ctx.clone(), bytecode) }
                .map_err(|e| guest_error(&ctx, e, &shared))?;
            let (module, _progress) = module
                .eval()
                .map_err(|e| guest_error(&ctx, e, &shared))?;
            let namespace = module
                .namespace()
                .map_err(|e| guest_error(&ctx, e, &shared))?;

            let native = binder(&ctx, &shared).map_err(|e| guest_error(&ctx, e, &shared))?;
            let bind: Function = namespace
                .get("__bind")
                .map_err(|_| EngineError::internal("compiled module is missing __bind"))?;
            bind.call::<_, ()>((native,))
                .map_err(|e| guest_error(&ctx, e, &shared))?;

            let handler: Function = namespace.get("default").map_err(|_| {
                EngineError::internal("compiled module is missing its default export")
            })?;
            let input = build_input(&ctx, &shared)?;
            let promise: Promise = handler
                .call((input,))
                .map_err(|e| guest_error(&ctx, e, &shared))?;

            pending_slot = Some(PendingRun {
                promise: Persistent::save(&ctx, promise),
                namespace: Persistent::save(&ctx, namespace),
            });
            Ok(())
        });

        self.context = Some(js_context);

        if let Err(error) = setup {
            return Ok(RunOutcome::Failed { error });
        }
        self.pending = pending_slot;
        self.pump()
    }

    /// Deliver an asynchronous result to a suspended instance and continue
    /// execution, which may suspend again.
    #[instrument(skip(self, result), fields(instance_id = self.id))]
    pub fn resume(&mut self, result: AsyncCallResult) -> Result<RunOutcome, EngineError> {
        if self.state != InstanceState::Suspended {
            return Err(EngineError::internal(format!(
                "instance {} cannot resume while {}",
                self.id, self.state
            )));
        }
        let suspension_id = self
            .suspension_id
            .take()
            .ok_or_else(|| EngineError::internal("suspended instance has no suspension id"))?;

        self.interrupt.store(false, Ordering::Relaxed);
        self.state = InstanceState::Active;

        let js_context = self
            .context
            .as_ref()
            .ok_or_else(|| EngineError::internal("suspended instance has no guest context"))?;
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| EngineError::internal("suspended instance has no pending run"))?;
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| EngineError::internal("suspended instance has no execution context"))?
            .clone();

        let injected: Result<(), EngineError> = js_context.with(|ctx| {
            let namespace = pending.namespace.clone().restore(&ctx).map_err(|e| {
                EngineError::internal(format!("failed to restore module namespace: {e}"))
            })?;
            let resume: Function = namespace
                .get("__resume")
                .map_err(|_| EngineError::internal("compiled module is missing __resume"))?;
            let value = json_to_js(&ctx, &result.value)
                .map_err(|e| EngineError::serialization(format!("async result: {e}")))?;
            resume
                .call::<_, ()>((suspension_id.as_str(), result.success, value))
                .map_err(|e| guest_error(&ctx, e, &shared))?;
            Ok(())
        });

        if let Err(error) = injected {
            return Ok(RunOutcome::Failed { error });
        }
        self.pump()
    }

    /// Drain the microtask queue and classify the top-level promise.
    fn pump(&mut self) -> Result<RunOutcome, EngineError> {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                // A job threw; the failure surfaces through the promise.
                Err(_) => {}
            }
        }
        self.observe_memory();

        let js_context = self
            .context
            .as_ref()
            .ok_or_else(|| EngineError::internal("instance has no active guest context"))?;
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| EngineError::internal("instance has no pending run"))?;
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| EngineError::internal("instance has no execution context"))?
            .clone();

        let outcome = js_context.with(|ctx| -> Result<RunOutcome, EngineError> {
            let promise = pending.promise.clone().restore(&ctx).map_err(|e| {
                EngineError::internal(format!("failed to restore run promise: {e}"))
            })?;

            match promise.state() {
                PromiseState::Resolved => match promise.result::<Value>() {
                    Some(Ok(value)) => match js_to_json(&value) {
                        Ok(value) => Ok(RunOutcome::Completed { value }),
                        Err(error) => Ok(RunOutcome::Failed { error }),
                    },
                    Some(Err(e)) => Ok(RunOutcome::Failed {
                        error: guest_error(&ctx, e, &shared),
                    }),
                    None => Err(EngineError::internal("resolved promise had no result")),
                },
                PromiseState::Rejected => {
                    let error = match promise.result::<Value>() {
                        Some(Err(rquickjs::Error::Exception)) => {
                            error_from_thrown(&ctx.catch(), &shared)
                        }
                        Some(Err(other)) => EngineError::trap(other.to_string()),
                        _ => EngineError::internal("rejected promise had no exception"),
                    };
                    Ok(RunOutcome::Failed { error })
                }
                PromiseState::Pending => {
                    let suspension = shared.lock().take_suspension();
                    match suspension {
                        Some(suspension) => Ok(RunOutcome::Suspended { suspension }),
                        None => Ok(RunOutcome::Failed {
                            error: EngineError::internal(
                                "handler awaited a promise the engine cannot resolve",
                            ),
                        }),
                    }
                }
            }
        })?;

        if let RunOutcome::Suspended { suspension } = &outcome {
            trace!(
                instance_id = self.id,
                suspension_id = %suspension.id,
                extension = %suspension.extension,
                "Instance suspended"
            );
            self.state = InstanceState::Suspended;
            self.suspension_id = Some(suspension.id.clone());
        }
        Ok(outcome)
    }

    /// Reset guest-visible state and return to Idle.
    ///
    /// A no-op on an already-Idle instance; terminated instances stay
    /// terminated.
    pub fn reset(&mut self) {
        if matches!(self.state, InstanceState::Idle | InstanceState::Terminated) {
            return;
        }
        self.pending = None;
        self.suspension_id = None;
        self.shared = None;
        self.context = None;
        self.interrupt.store(false, Ordering::Relaxed);
        self.runtime.run_gc();
        self.memory_high_water = 0;
        self.state = InstanceState::Idle;
    }

    /// Destroy the guest VM. The instance can never be reused.
    pub fn terminate(&mut self) {
        debug!(instance_id = self.id, "Instance terminated");
        self.pending = None;
        self.suspension_id = None;
        self.shared = None;
        self.context = None;
        self.state = InstanceState::Terminated;
    }

    fn observe_memory(&mut self) {
        let usage = self.runtime.memory_usage();
        let used = u64::try_from(usage.memory_used_size.max(0)).unwrap_or(0);
        if used > self.memory_high_water {
            self.memory_high_water = used;
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Marshal `{args, scope}` for the handler invocation.
fn build_input<'js>(ctx: &Ctx<'js>, shared: &SharedContext) -> Result<Value<'js>, EngineError> {
    let input = {
        let guard = shared.lock();
        let mut input = serde_json::Map::new();
        input.insert(
            "args".to_string(),
            serde_json::Value::Object(guard.args().clone()),
        );
        input.insert(
            "scope".to_string(),
            guard
                .scope()
                .cloned()
                .map_or(serde_json::Value::Null, serde_json::Value::Object),
        );
        serde_json::Value::Object(input)
    };
    json_to_js(ctx, &input)
        .map_err(|e| EngineError::internal(format!("failed to marshal handler input: {e}")))
}

/// Map a QuickJS error raised while driving the guest into an engine error,
/// reclaiming the typed host error when the thrown value carries its code.
fn guest_error(ctx: &Ctx<'_>, error: rquickjs::Error, shared: &SharedContext) -> EngineError {
    if matches!(error, rquickjs::Error::Exception) {
        return error_from_thrown(&ctx.catch(), shared);
    }
    EngineError::trap(error.to_string())
}

fn error_from_thrown(thrown: &Value<'_>, shared: &SharedContext) -> EngineError {
    let (message, stack, code) = exception_parts(thrown);
    if let Some(code) = code {
        let mut guard = shared.lock();
        if let Some(host_error) = guard.host_error.take_if(|e| e.code() == code) {
            return host_error;
        }
    }
    // QuickJS signals an exhausted heap as an InternalError trap.
    if message.contains("out of memory") {
        return EngineError::resource_limit(ResourceKind::Memory, message);
    }
    EngineError::Trap { message, stack }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::context::{ExecutionRequest, ExtensionRegistry};
    use handler_runtime_common::{CacheConfig, Capability, EngineConfig};
    use serde_json::json;

    fn compile(source: &str) -> Vec<u8> {
        let engine = JsEngine::new(&EngineConfig::default()).unwrap();
        let compiler = Compiler::new(&engine, &CacheConfig::default()).unwrap();
        let (compiled, _) = compiler.compile(source).unwrap();
        compiled.bytecode().to_vec()
    }

    fn instance() -> Instance {
        let engine = JsEngine::new(&EngineConfig::default()).unwrap();
        Instance::new(&engine, handler_runtime_host::host_binder()).unwrap()
    }

    fn context_with(caps: &[&str], extensions: ExtensionRegistry) -> ExecutionContext {
        let mut request = ExecutionRequest::new("test");
        request.capabilities = caps
            .iter()
            .map(|c| Capability::parse(c).unwrap())
            .collect();
        request.extensions = extensions;
        ExecutionContext::new(request, 1_000)
    }

    #[test]
    fn test_execute_returns_value() {
        let bytecode = compile("return 1 + 2;");
        let mut instance = instance();

        let outcome = instance
            .begin(&bytecode, context_with(&[], ExtensionRegistry::default()))
            .unwrap();

        match outcome {
            RunOutcome::Completed { value } => assert_eq!(value, json!(3)),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(instance.state(), InstanceState::Active);
    }

    #[test]
    fn test_args_visible_to_handler() {
        let bytecode = compile("return args.n * 2;");
        let mut instance = instance();

        let mut request = ExecutionRequest::new("test");
        request.args.insert("n".into(), json!(21));
        let context = ExecutionContext::new(request, 100);

        let outcome = instance.begin(&bytecode, context).unwrap();
        match outcome {
            RunOutcome::Completed { value } => assert_eq!(value, json!(42)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_uncaught_throw_is_trap() {
        let bytecode = compile("throw new Error('boom');");
        let mut instance = instance();

        let outcome = instance
            .begin(&bytecode, context_with(&[], ExtensionRegistry::default()))
            .unwrap();

        match outcome {
            RunOutcome::Failed { error } => {
                assert!(matches!(error, EngineError::Trap { .. }));
                assert!(error.to_string().contains("boom"));
            }
            other => panic!("expected trap, got {other:?}"),
        }
    }

    #[test]
    fn test_suspend_then_resume_to_completion() {
        let bytecode = compile("const r = await ext.http.get('https://example.com'); return r.x;");
        let mut instance = instance();

        let mut extensions = ExtensionRegistry::default();
        extensions.register("http", ["get"]);

        let outcome = instance
            .begin(&bytecode, context_with(&["ext:http"], extensions))
            .unwrap();

        let suspension = match outcome {
            RunOutcome::Suspended { suspension } => suspension,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(suspension.extension, "http");
        assert_eq!(suspension.method, "get");
        assert_eq!(suspension.args, vec![json!("https://example.com")]);
        assert_eq!(instance.state(), InstanceState::Suspended);

        let outcome = instance
            .resume(AsyncCallResult::ok(json!({ "x": 5 })))
            .unwrap();
        match outcome {
            RunOutcome::Completed { value } => assert_eq!(value, json!(5)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_failure_rejects_into_handler() {
        let bytecode = compile(
            "try { await ext.http.get('u'); return 'unreachable'; } catch (e) { return e.message; }",
        );
        let mut instance = instance();

        let mut extensions = ExtensionRegistry::default();
        extensions.register("http", ["get"]);

        let outcome = instance
            .begin(&bytecode, context_with(&["ext:*"], extensions))
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Suspended { .. }));

        let outcome = instance
            .resume(AsyncCallResult::failed("connection refused"))
            .unwrap();
        match outcome {
            RunOutcome::Completed { value } => assert_eq!(value, json!("connection refused")),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_in_wrong_state_is_internal_error() {
        let mut instance = instance();
        let err = instance
            .resume(AsyncCallResult::ok(json!(null)))
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
    }

    #[test]
    fn test_reset_is_idempotent_and_reuses_instance() {
        let bytecode = compile("return 'first';");
        let mut instance = instance();

        instance
            .begin(&bytecode, context_with(&[], ExtensionRegistry::default()))
            .unwrap();
        instance.reset();
        assert_eq!(instance.state(), InstanceState::Idle);

        // A second reset is a no-op.
        instance.reset();
        assert_eq!(instance.state(), InstanceState::Idle);

        let outcome = instance
            .begin(&bytecode, context_with(&[], ExtensionRegistry::default()))
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[test]
    fn test_guest_globals_do_not_leak_across_runs() {
        let mut instance = instance();

        let write = compile("globalThis.leak = 'secret'; return true;");
        instance
            .begin(&write, context_with(&[], ExtensionRegistry::default()))
            .unwrap();
        instance.reset();

        let read = compile("return typeof globalThis.leak;");
        let outcome = instance
            .begin(&read, context_with(&[], ExtensionRegistry::default()))
            .unwrap();
        match outcome {
            RunOutcome::Completed { value } => assert_eq!(value, json!("undefined")),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_terminated_instance_rejects_runs() {
        let mut instance = instance();
        instance.terminate();
        assert_eq!(instance.state(), InstanceState::Terminated);

        let bytecode = compile("return 1;");
        let err = instance
            .begin(&bytecode, context_with(&[], ExtensionRegistry::default()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
    }
}
