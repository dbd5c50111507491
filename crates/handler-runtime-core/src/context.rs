//! Per-execution request/response data model and side-effect accumulation.
//!
//! This module provides:
//! - [`ExecutionRequest`]: the immutable inbound contract from the host
//! - [`ExecutionContext`]: per-run mutable state written to by host functions
//! - [`ExecutionResult`]: the outbound contract, carrying accumulated effects
//! - [`SuspensionState`]: the pending asynchronous extension call, if any
//!
//! The context is created at execution start, mutated only by host function
//! calls, drained on suspension or terminal completion, and never shared
//! between concurrent executions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use handler_runtime_common::{Capability, CapabilityChecker, EngineError, ResourceKind};

/// Ordered key-value map used for state snapshots, args and scopes.
pub type ValueMap = serde_json::Map<String, serde_json::Value>;

/// Handle to the per-run context shared with host functions.
///
/// One per in-flight execution; host function closures hold clones while
/// the guest runs. Never crosses executions.
pub type SharedContext = Arc<Mutex<ExecutionContext>>;

/// Methods exposed by one extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionSpec {
    /// Method names callable through the suspend protocol.
    pub methods: Vec<String>,
}

/// Extensions available to a single execution, declared by the host on the
/// request. The engine validates calls against this registry but never
/// invokes extensions itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionRegistry {
    extensions: std::collections::BTreeMap<String, ExtensionSpec>,
}

impl ExtensionRegistry {
    /// Register an extension with its callable methods.
    pub fn register<S: Into<String>>(
        &mut self,
        name: impl Into<String>,
        methods: impl IntoIterator<Item = S>,
    ) {
        self.extensions.insert(
            name.into(),
            ExtensionSpec {
                methods: methods.into_iter().map(Into::into).collect(),
            },
        );
    }

    /// Look up an extension by name.
    pub fn get(&self, name: &str) -> Option<&ExtensionSpec> {
        self.extensions.get(name)
    }

    /// Check that an extension exposes a method.
    pub fn has_method(&self, name: &str, method: &str) -> bool {
        self.get(name)
            .is_some_and(|spec| spec.methods.iter().any(|m| m == method))
    }

    /// Registered extension names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.extensions.keys().map(String::as_str)
    }
}

/// Inbound execution request, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Handler identifier, used for tracing and compile diagnostics.
    pub handler_id: String,

    /// Read-only state snapshot the handler may read from.
    pub state: ValueMap,

    /// Input arguments for this invocation.
    pub args: ValueMap,

    /// Capabilities granted to this execution.
    pub capabilities: Vec<Capability>,

    /// Optional lexical scope for nested/iterative contexts.
    pub scope: Option<ValueMap>,

    /// Extensions reachable through the suspend protocol.
    pub extensions: ExtensionRegistry,

    /// Per-request timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    /// Create an empty request for the given handler.
    pub fn new(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            ..Default::default()
        }
    }
}

/// A single state mutation recorded by the handler.
///
/// The engine never applies mutations; the host replays the ordered list
/// against its own state store after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StateMutation {
    /// Set a key to a value.
    Set {
        key: String,
        value: serde_json::Value,
    },
    /// Delete a key.
    Delete { key: String },
}

/// An event emitted by the handler, for the host to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    /// Event name.
    pub name: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// A UI command issued against a component, for the host to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewCommand {
    /// Target component id.
    pub component: String,
    /// Command name.
    pub command: String,
    /// Command parameters.
    pub params: serde_json::Value,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl LogLevel {
    /// Parse a guest-provided level name, defaulting to `Info`.
    pub fn parse(level: &str) -> Self {
        match level {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// A single log entry from guest code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message content.
    pub message: String,
}

/// A paused asynchronous extension call awaiting a host-delivered result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionState {
    /// Single-use suspension id.
    pub id: String,
    /// Extension name.
    pub extension: String,
    /// Method name.
    pub method: String,
    /// Serialized call arguments.
    pub args: Vec<serde_json::Value>,
}

/// Side effects drained from a context at a suspension or completion
/// boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// Ordered state mutations.
    pub mutations: Vec<StateMutation>,
    /// Emitted events.
    pub events: Vec<EmittedEvent>,
    /// Issued view commands.
    pub commands: Vec<ViewCommand>,
    /// Guest log entries.
    pub logs: Vec<LogEntry>,
}

/// Per-run mutable execution state.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Handler identifier.
    pub handler_id: String,

    state: ValueMap,
    args: ValueMap,
    scope: Option<ValueMap>,
    checker: CapabilityChecker,
    extensions: ExtensionRegistry,

    mutations: Vec<StateMutation>,
    events: Vec<EmittedEvent>,
    commands: Vec<ViewCommand>,
    logs: Vec<LogEntry>,

    host_calls: u32,
    max_host_calls: u32,
    timeout_ms: Option<u64>,

    pending_suspension: Option<SuspensionState>,

    /// Typed error recorded by the last failing host call, reclaimed when
    /// the matching guest exception surfaces as a rejection.
    pub host_error: Option<EngineError>,
}

impl ExecutionContext {
    /// Build a context from a request and the configured host-call ceiling.
    pub fn new(request: ExecutionRequest, max_host_calls: u32) -> Self {
        let checker = CapabilityChecker::new(request.capabilities);
        Self {
            handler_id: request.handler_id,
            state: request.state,
            args: request.args,
            scope: request.scope,
            checker,
            extensions: request.extensions,
            mutations: Vec::new(),
            events: Vec::new(),
            commands: Vec::new(),
            logs: Vec::new(),
            host_calls: 0,
            max_host_calls,
            timeout_ms: request.timeout_ms,
            pending_suspension: None,
            host_error: None,
        }
    }

    /// Per-request timeout override, if the request carried one.
    ///
    /// Survives suspension so every resumed segment gets the same budget.
    pub fn timeout_override(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Count one host call against the ceiling.
    ///
    /// Every host function call goes through here first; effects recorded
    /// before the ceiling was reached stay in the context.
    pub fn count_host_call(&mut self) -> Result<(), EngineError> {
        self.host_calls += 1;
        if self.host_calls > self.max_host_calls {
            return Err(EngineError::resource_limit(
                ResourceKind::HostCalls,
                format!("host call ceiling of {} exceeded", self.max_host_calls),
            ));
        }
        Ok(())
    }

    /// Check a required capability string against the granted list.
    pub fn check_capability(&self, required: &str) -> Result<(), EngineError> {
        if self.checker.check(required) {
            Ok(())
        } else {
            Err(EngineError::permission_denied(required))
        }
    }

    /// Read a state key through the read-your-writes overlay: the latest
    /// mutation for the key wins over the snapshot.
    pub fn state_get(&self, key: &str) -> Option<serde_json::Value> {
        for mutation in self.mutations.iter().rev() {
            match mutation {
                StateMutation::Set { key: k, value } if k == key => return Some(value.clone()),
                StateMutation::Delete { key: k } if k == key => return None,
                _ => {}
            }
        }
        self.state.get(key).cloned()
    }

    /// Check key presence through the overlay.
    pub fn state_has(&self, key: &str) -> bool {
        self.state_get(key).is_some()
    }

    /// Enumerate visible state keys through the overlay, in snapshot order
    /// with this run's additions appended.
    pub fn state_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .keys()
            .filter(|key| self.state_has(key))
            .cloned()
            .collect();
        for mutation in &self.mutations {
            if let StateMutation::Set { key, .. } = mutation {
                if !keys.iter().any(|k| k == key) && self.state_has(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// Input arguments.
    pub fn args(&self) -> &ValueMap {
        &self.args
    }

    /// Lexical scope, if provided.
    pub fn scope(&self) -> Option<&ValueMap> {
        self.scope.as_ref()
    }

    /// Extension registry for this run.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Record a state set.
    pub fn record_set(&mut self, key: String, value: serde_json::Value) {
        self.mutations.push(StateMutation::Set { key, value });
    }

    /// Record a state delete.
    pub fn record_delete(&mut self, key: String) {
        self.mutations.push(StateMutation::Delete { key });
    }

    /// Record an emitted event.
    pub fn record_event(&mut self, name: String, payload: serde_json::Value) {
        self.events.push(EmittedEvent { name, payload });
    }

    /// Record a view command.
    pub fn record_command(&mut self, component: String, command: String, params: serde_json::Value) {
        self.commands.push(ViewCommand {
            component,
            command,
            params,
        });
    }

    /// Record a guest log entry.
    pub fn record_log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry { level, message });
    }

    /// Store the pending suspension. Errors if one is already pending: the
    /// data model holds at most one.
    pub fn set_suspension(&mut self, suspension: SuspensionState) -> Result<(), EngineError> {
        if self.pending_suspension.is_some() {
            return Err(EngineError::internal(
                "an extension call is already pending for this execution",
            ));
        }
        self.pending_suspension = Some(suspension);
        Ok(())
    }

    /// Take the pending suspension, if any.
    pub fn take_suspension(&mut self) -> Option<SuspensionState> {
        self.pending_suspension.take()
    }

    /// Host calls made so far.
    pub fn host_calls(&self) -> u32 {
        self.host_calls
    }

    /// Drain accumulated side effects at a suspension or completion
    /// boundary.
    pub fn drain_effects(&mut self) -> Effects {
        Effects {
            mutations: std::mem::take(&mut self.mutations),
            events: std::mem::take(&mut self.events),
            commands: std::mem::take(&mut self.commands),
            logs: std::mem::take(&mut self.logs),
        }
    }
}

/// Terminal status of one engine round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// The handler ran to completion.
    Success,
    /// The handler is paused awaiting an extension result.
    Suspended,
    /// The run failed; see the error detail.
    Error,
}

/// Structured error surfaced on an error result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Source line, when known.
    pub line: Option<u32>,
    /// Source column, when known.
    pub column: Option<u32>,
    /// Offending source snippet, when known.
    pub snippet: Option<String>,
    /// Guest stack trace; only populated when the debug flag is enabled.
    pub stack: Option<String>,
}

impl ErrorDetail {
    /// Build the wire-facing detail for an engine error.
    ///
    /// The guest stack is stripped unless `debug` is set, so guest
    /// internals do not leak to production hosts.
    pub fn from_error(error: &EngineError, debug: bool) -> Self {
        let (line, column, stack) = match error {
            EngineError::Compilation { line, column, .. } => (*line, *column, None),
            EngineError::Trap { stack, .. } => {
                // Stack frames reference the wrapped module; shift line
                // numbers into handler coordinates and drop frames that
                // point into the template.
                let location = stack
                    .as_deref()
                    .and_then(crate::value::parse_stack_location)
                    .and_then(|(line, column)| {
                        line.checked_sub(crate::compiler::prelude_line_count())
                            .filter(|line| *line >= 1)
                            .map(|line| (line, column))
                    });
                (
                    location.map(|(line, _)| line),
                    location.and_then(|(_, column)| column),
                    if debug { stack.clone() } else { None },
                )
            }
            _ => (None, None, None),
        };

        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            line,
            column,
            snippet: None,
            stack,
        }
    }
}

/// Execution metrics reported with every result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionMetrics {
    /// Wall-clock duration of this VM segment.
    pub duration: Duration,
    /// Guest memory high-water mark in bytes.
    pub memory_peak_bytes: u64,
    /// Host calls made so far in this execution.
    pub host_calls: u32,
    /// Whether the bytecode came from the cache.
    pub cache_hit: bool,
}

/// Outbound execution result.
///
/// Mutations, events and commands are advisory: the host applies them to
/// its own stores; the engine never does.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Handler return value on success.
    pub value: Option<serde_json::Value>,
    /// Side effects accumulated during this segment.
    pub effects: Effects,
    /// Suspension details when status is `Suspended`.
    pub suspension: Option<SuspensionState>,
    /// Error detail when status is `Error`.
    pub error: Option<ErrorDetail>,
    /// Execution metrics.
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    /// Successful completion.
    pub fn success(
        value: serde_json::Value,
        effects: Effects,
        metrics: ExecutionMetrics,
    ) -> Self {
        Self {
            status: ExecutionStatus::Success,
            value: Some(value),
            effects,
            suspension: None,
            error: None,
            metrics,
        }
    }

    /// Suspended awaiting an extension result.
    pub fn suspended(
        suspension: SuspensionState,
        effects: Effects,
        metrics: ExecutionMetrics,
    ) -> Self {
        Self {
            status: ExecutionStatus::Suspended,
            value: None,
            effects,
            suspension: Some(suspension),
            error: None,
            metrics,
        }
    }

    /// Failed run, retaining the effects recorded before the failure.
    pub fn failure(
        error: &EngineError,
        debug: bool,
        effects: Effects,
        metrics: ExecutionMetrics,
    ) -> Self {
        Self {
            status: ExecutionStatus::Error,
            value: None,
            effects,
            suspension: None,
            error: Some(ErrorDetail::from_error(error, debug)),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handler_runtime_common::Capability;
    use serde_json::json;

    fn request_with_caps(caps: &[&str]) -> ExecutionRequest {
        let mut request = ExecutionRequest::new("test-handler");
        request.capabilities = caps
            .iter()
            .map(|raw| Capability::parse(raw).unwrap())
            .collect();
        request
    }

    #[test]
    fn test_host_call_ceiling() {
        let mut ctx = ExecutionContext::new(ExecutionRequest::new("h"), 3);

        for _ in 0..3 {
            ctx.count_host_call().unwrap();
        }
        let err = ctx.count_host_call().unwrap_err();
        assert!(matches!(err, EngineError::ResourceLimit { .. }));
        assert_eq!(ctx.host_calls(), 4);
    }

    #[test]
    fn test_capability_check() {
        let ctx = ExecutionContext::new(request_with_caps(&["state:read:count"]), 10);

        assert!(ctx.check_capability("state:read:count").is_ok());
        let err = ctx.check_capability("state:read:other").unwrap_err();
        assert!(
            matches!(err, EngineError::PermissionDenied { ref capability } if capability == "state:read:other")
        );
    }

    #[test]
    fn test_read_your_writes_overlay() {
        let mut request = ExecutionRequest::new("h");
        request.state.insert("count".into(), json!(1));
        request.state.insert("name".into(), json!("a"));
        let mut ctx = ExecutionContext::new(request, 100);

        assert_eq!(ctx.state_get("count"), Some(json!(1)));

        ctx.record_set("count".into(), json!(2));
        assert_eq!(ctx.state_get("count"), Some(json!(2)));

        ctx.record_delete("name".into());
        assert_eq!(ctx.state_get("name"), None);
        assert!(!ctx.state_has("name"));

        ctx.record_set("fresh".into(), json!(true));
        assert_eq!(ctx.state_keys(), vec!["count", "fresh"]);
    }

    #[test]
    fn test_single_pending_suspension() {
        let mut ctx = ExecutionContext::new(ExecutionRequest::new("h"), 100);

        ctx.set_suspension(SuspensionState {
            id: "s-1".into(),
            extension: "http".into(),
            method: "get".into(),
            args: vec![],
        })
        .unwrap();

        let err = ctx
            .set_suspension(SuspensionState {
                id: "s-2".into(),
                extension: "http".into(),
                method: "get".into(),
                args: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));

        assert_eq!(ctx.take_suspension().unwrap().id, "s-1");
        assert!(ctx.take_suspension().is_none());
    }

    #[test]
    fn test_drain_effects() {
        let mut ctx = ExecutionContext::new(ExecutionRequest::new("h"), 100);
        ctx.record_set("k".into(), json!(1));
        ctx.record_event("saved".into(), json!({}));
        ctx.record_log(LogLevel::Info, "hello".into());

        let effects = ctx.drain_effects();
        assert_eq!(effects.mutations.len(), 1);
        assert_eq!(effects.events.len(), 1);
        assert_eq!(effects.logs.len(), 1);

        // Second drain is empty; the counter survives the boundary.
        let effects = ctx.drain_effects();
        assert!(effects.mutations.is_empty());
    }

    #[test]
    fn test_extension_registry() {
        let mut registry = ExtensionRegistry::default();
        registry.register("http", ["get", "post"]);

        assert!(registry.get("http").is_some());
        assert!(registry.has_method("http", "get"));
        assert!(!registry.has_method("http", "put"));
        assert!(!registry.has_method("kv", "get"));
    }

    #[test]
    fn test_error_detail_stack_gating() {
        // Stack lines count from the wrapped module; line 3 of the handler
        // source sits below the template prelude.
        let wrapped_line = crate::compiler::prelude_line_count() + 3;
        let error = EngineError::Trap {
            message: "boom".into(),
            stack: Some(format!("    at handler (handler:{wrapped_line}:7)")),
        };

        let detail = ErrorDetail::from_error(&error, false);
        assert_eq!(detail.code, "Trap");
        assert!(detail.stack.is_none());
        assert_eq!(detail.line, Some(3));
        assert_eq!(detail.column, Some(7));

        let detail = ErrorDetail::from_error(&error, true);
        assert!(detail.stack.is_some());
    }

    #[test]
    fn test_error_detail_drops_template_frames() {
        // A frame inside the template itself must not leak a location.
        let error = EngineError::Trap {
            message: "boom".into(),
            stack: Some("    at __unwrap (handler:8:5)".into()),
        };
        let detail = ErrorDetail::from_error(&error, false);
        assert!(detail.line.is_none());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("error"), LogLevel::Error);
        assert_eq!(LogLevel::parse("info"), LogLevel::Info);
        assert_eq!(LogLevel::parse("whatever"), LogLevel::Info);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogLevel::Info.to_string(), "info");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::Error.to_string(), "error");
    }
}
