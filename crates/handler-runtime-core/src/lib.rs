//! Core QuickJS execution engine for handler-runtime.
//!
//! This crate provides the fundamental handler execution capabilities:
//! - [`JsEngine`]: Configured guest runtime factory
//! - [`Compiler`]: Source wrapping plus the two-tier bytecode cache
//! - [`Instance`]: One guest VM with explicit lifecycle states
//! - [`InstancePool`]: Instance recycling under a concurrency ceiling
//! - [`HandlerRuntime`]: The orchestrator exposing the engine entry points
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    HandlerRuntime                       │
//! │  execute / precompile / resume / stats / shutdown       │
//! └─────────────────────────────────────────────────────────┘
//!            │                              │
//!            ▼                              ▼
//! ┌──────────────────────┐      ┌──────────────────────────┐
//! │       Compiler       │      │       InstancePool       │
//! │  memory LRU + disk   │      │  semaphore admission,    │
//! │  bytecode tiers      │      │  idle LIFO, suspension   │
//! └──────────────────────┘      │  index                   │
//!                               └──────────────────────────┘
//!                                          │
//!                                          ▼
//!                               ┌──────────────────────────┐
//!                               │    Instance (QuickJS)    │
//!                               │  fresh context per run,  │
//!                               │  ExecutionContext with   │
//!                               │  capability-gated host   │
//!                               │  functions               │
//!                               └──────────────────────────┘
//! ```

pub mod compiler;
pub mod context;
pub mod engine;
pub mod instance;
pub mod pool;
pub mod runtime;
pub mod value;

pub use compiler::{CacheStats, CompiledHandler, Compiler, BYTECODE_FORMAT_VERSION};
pub use context::{
    Effects, EmittedEvent, ErrorDetail, ExecutionContext, ExecutionMetrics, ExecutionRequest,
    ExecutionResult, ExecutionStatus, ExtensionRegistry, ExtensionSpec, LogEntry, LogLevel,
    SharedContext, StateMutation, SuspensionState, ValueMap, ViewCommand,
};
pub use engine::JsEngine;
pub use instance::{AsyncCallResult, HostBinder, Instance, InstanceState, RunOutcome};
pub use pool::{InstancePool, PoolLease, PoolStats};
pub use runtime::{HandlerRuntime, MetricsSnapshot, RuntimeStats};
