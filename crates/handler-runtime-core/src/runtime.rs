//! Runtime orchestrator: ties compiler, pool and metrics together.
//!
//! [`HandlerRuntime`] exposes the engine's entry points (execute,
//! precompile, resume, stats, shutdown) and enforces per-segment timeouts
//! by racing the blocking VM run against a timer. On expiry the instance's
//! interrupt flag aborts the guest and the instance is terminated rather
//! than reset, since its internal state is unknown.
//!
//! All state is owned by the orchestrator instance; multiple orchestrators
//! coexist in one process (and in tests).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use handler_runtime_common::{EngineError, RuntimeConfig};

use crate::compiler::{CacheStats, CompiledHandler, Compiler};
use crate::context::{Effects, ExecutionContext, ExecutionMetrics, ExecutionRequest, ExecutionResult};
use crate::engine::JsEngine;
use crate::instance::{AsyncCallResult, HostBinder, Instance, RunOutcome};
use crate::pool::{InstancePool, PoolLease, PoolStats};

/// Counters accumulated across the orchestrator's lifetime.
#[derive(Debug, Default)]
struct EngineMetrics {
    executions: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    suspensions: AtomicU64,
    resumes: AtomicU64,
    timeouts: AtomicU64,
    total_duration_ms: AtomicU64,
}

/// Serializable snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Executions started (including resumes' parent executions once).
    pub executions: u64,
    /// Segments that ran to completion.
    pub completed: u64,
    /// Segments that failed.
    pub errored: u64,
    /// Suspensions issued.
    pub suspensions: u64,
    /// Resume calls accepted.
    pub resumes: u64,
    /// Segments that timed out.
    pub timeouts: u64,
    /// Cumulative VM segment wall-clock milliseconds.
    pub total_duration_ms: u64,
}

impl EngineMetrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Combined pool, cache and engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    /// Instance pool statistics.
    pub pool: PoolStats,
    /// Bytecode cache statistics.
    pub cache: CacheStats,
    /// Engine counters.
    pub engine: MetricsSnapshot,
}

/// One VM segment of work.
enum Segment {
    Begin {
        compiled: Arc<CompiledHandler>,
        context: ExecutionContext,
    },
    Resume {
        result: AsyncCallResult,
    },
}

/// The engine's orchestrator and public entry point.
pub struct HandlerRuntime {
    config: RuntimeConfig,
    engine: JsEngine,
    compiler: Compiler,
    pool: InstancePool,
    metrics: EngineMetrics,
}

impl HandlerRuntime {
    /// Create an orchestrator with the given configuration and host binder.
    ///
    /// The binder builds the `__native` host object for each execution;
    /// use `handler_runtime_host::create_runtime` for the standard wiring.
    pub fn new(config: RuntimeConfig, binder: HostBinder) -> Result<Self, EngineError> {
        let engine = JsEngine::new(&config.engine)?;
        let compiler = Compiler::new(&engine, &config.cache)?;
        let pool = InstancePool::new(&config.pool, engine.clone(), binder)?;

        info!(
            max_instances = config.pool.max_instances,
            timeout_ms = config.execution.timeout_ms,
            "Handler runtime initialized"
        );

        Ok(Self {
            config,
            engine,
            compiler,
            pool,
            metrics: EngineMetrics::default(),
        })
    }

    /// Compile (or fetch from cache) and execute handler source.
    ///
    /// Compile errors surface as `status = error` results; they are never
    /// cached.
    #[instrument(skip(self, source, request), fields(handler_id = %request.handler_id))]
    pub async fn execute(
        &self,
        source: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, EngineError> {
        self.metrics.executions.fetch_add(1, Ordering::Relaxed);

        let (compiled, cache_hit) = match self.compiler.compile(source) {
            Ok(pair) => pair,
            Err(error @ EngineError::Compilation { .. }) => {
                self.metrics.errored.fetch_add(1, Ordering::Relaxed);
                let mut result = ExecutionResult::failure(
                    &error,
                    self.engine.debug_enabled(),
                    Effects::default(),
                    ExecutionMetrics::default(),
                );
                attach_snippet(&mut result, source);
                return Ok(result);
            }
            Err(other) => return Err(other),
        };

        let mut result = self.execute_entry(compiled, request, cache_hit).await?;
        attach_snippet(&mut result, source);
        Ok(result)
    }

    /// Execute previously compiled bytecode.
    #[instrument(skip(self, bytecode, request), fields(handler_id = %request.handler_id))]
    pub async fn execute_compiled(
        &self,
        bytecode: Vec<u8>,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, EngineError> {
        if bytecode.is_empty() {
            return Err(EngineError::serialization("empty handler bytecode"));
        }
        self.metrics.executions.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(CompiledHandler::from_bytecode(bytecode));
        self.execute_entry(compiled, request, false).await
    }

    async fn execute_entry(
        &self,
        compiled: Arc<CompiledHandler>,
        request: ExecutionRequest,
        cache_hit: bool,
    ) -> Result<ExecutionResult, EngineError> {
        let timeout = request
            .timeout_ms
            .map_or_else(|| self.config.execution.timeout(), Duration::from_millis);
        let lease = self.pool.acquire().await?;
        let context = ExecutionContext::new(request, self.config.execution.max_host_calls);

        self.run_segment(
            lease,
            Segment::Begin { compiled, context },
            timeout,
            cache_hit,
        )
        .await
    }

    /// Deliver an asynchronous result to a suspended execution.
    ///
    /// Suspension ids are single-use; an unknown or consumed id fails with
    /// [`EngineError::SuspensionNotFound`].
    #[instrument(skip(self, result))]
    pub async fn resume(
        &self,
        suspension_id: &str,
        result: AsyncCallResult,
    ) -> Result<ExecutionResult, EngineError> {
        self.metrics.resumes.fetch_add(1, Ordering::Relaxed);
        let lease = self.pool.take_suspended(suspension_id)?;

        let timeout = lease
            .instance
            .with_context(|c| c.timeout_override())
            .flatten()
            .map_or_else(|| self.config.execution.timeout(), Duration::from_millis);

        self.run_segment(lease, Segment::Resume { result }, timeout, false)
            .await
    }

    /// Compile handler source to cacheable bytecode without executing it.
    pub fn precompile(&self, source: &str) -> Result<Vec<u8>, EngineError> {
        let (compiled, _) = self.compiler.compile(source)?;
        Ok(compiled.bytecode().to_vec())
    }

    /// Pool, cache and engine statistics.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.pool.stats(),
            cache: self.compiler.stats(),
            engine: self.metrics.snapshot(),
        }
    }

    /// Drain and terminate every instance; subsequent calls fail with
    /// [`EngineError::ShuttingDown`].
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run one VM segment with a timeout race, then route the outcome.
    async fn run_segment(
        &self,
        lease: PoolLease,
        segment: Segment,
        timeout: Duration,
        cache_hit: bool,
    ) -> Result<ExecutionResult, EngineError> {
        let (mut instance, permit) = lease.into_parts();
        let interrupt = instance.interrupt_flag();
        let started = Instant::now();

        let mut handle = tokio::task::spawn_blocking(move || {
            let outcome = match segment {
                Segment::Begin { compiled, context } => {
                    instance.begin(compiled.bytecode(), context)
                }
                Segment::Resume { result } => instance.resume(result),
            };
            (instance, outcome)
        });

        let (instance, outcome) = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined
                .map_err(|e| EngineError::internal(format!("execution task failed: {e}")))?,
            Err(_) => {
                // Interrupt the guest, then wait for the blocking task to
                // observe it and unwind.
                interrupt.store(true, std::sync::atomic::Ordering::Relaxed);
                let (instance, _aborted) = handle
                    .await
                    .map_err(|e| EngineError::internal(format!("execution task failed: {e}")))?;
                return Ok(self.finish_timeout(instance, permit, timeout, started, cache_hit));
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                // Invariant violation: terminate defensively, propagate.
                warn!(error = %error, "Terminating instance after invariant violation");
                self.metrics.errored.fetch_add(1, Ordering::Relaxed);
                self.pool.terminate(PoolLease::from_parts(instance, permit));
                return Err(error);
            }
        };

        let duration = started.elapsed();
        self.metrics
            .total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        let host_calls = instance.with_context(|c| c.host_calls()).unwrap_or(0);
        let metrics = ExecutionMetrics {
            duration,
            memory_peak_bytes: instance.memory_high_water(),
            host_calls,
            cache_hit,
        };

        match outcome {
            RunOutcome::Completed { value } => {
                let effects = instance
                    .with_context(ExecutionContext::drain_effects)
                    .unwrap_or_default();
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                self.pool.release(PoolLease::from_parts(instance, permit));
                Ok(ExecutionResult::success(value, effects, metrics))
            }
            RunOutcome::Suspended { suspension } => {
                let effects = instance
                    .with_context(ExecutionContext::drain_effects)
                    .unwrap_or_default();
                self.metrics.suspensions.fetch_add(1, Ordering::Relaxed);
                self.pool
                    .suspend(PoolLease::from_parts(instance, permit), suspension.id.clone())?;
                Ok(ExecutionResult::suspended(suspension, effects, metrics))
            }
            RunOutcome::Failed { error } => {
                let effects = instance
                    .with_context(ExecutionContext::drain_effects)
                    .unwrap_or_default();
                self.metrics.errored.fetch_add(1, Ordering::Relaxed);

                let lease = PoolLease::from_parts(instance, permit);
                if error.is_terminal_for_instance() {
                    self.pool.terminate(lease);
                } else {
                    self.pool.release(lease);
                }
                Ok(ExecutionResult::failure(
                    &error,
                    self.engine.debug_enabled(),
                    effects,
                    metrics,
                ))
            }
        }
    }

    /// Salvage what the context recorded, then terminate the instance: its
    /// internal state after an interrupt is unknown.
    fn finish_timeout(
        &self,
        instance: Instance,
        permit: tokio::sync::OwnedSemaphorePermit,
        timeout: Duration,
        started: Instant,
        cache_hit: bool,
    ) -> ExecutionResult {
        self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
        self.metrics.errored.fetch_add(1, Ordering::Relaxed);

        let (effects, host_calls) = instance
            .with_context(|c| (c.drain_effects(), c.host_calls()))
            .unwrap_or_default();
        let metrics = ExecutionMetrics {
            duration: started.elapsed(),
            memory_peak_bytes: instance.memory_high_water(),
            host_calls,
            cache_hit,
        };

        let error = EngineError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        };
        warn!(timeout_ms = timeout.as_millis() as u64, "Execution timed out; instance terminated");
        self.pool.terminate(PoolLease::from_parts(instance, permit));

        ExecutionResult::failure(&error, self.engine.debug_enabled(), effects, metrics)
    }
}

/// Fill the error detail's snippet from the handler source when a line is
/// known. Only the source-in-hand paths use this; `execute_compiled` has
/// no source to quote.
fn attach_snippet(result: &mut ExecutionResult, source: &str) {
    if let Some(detail) = result.error.as_mut() {
        if detail.snippet.is_none() {
            if let Some(line) = detail.line {
                detail.snippet = source
                    .lines()
                    .nth(line.saturating_sub(1) as usize)
                    .map(|text| text.trim().to_string());
            }
        }
    }
}

impl std::fmt::Debug for HandlerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRuntime")
            .field("pool", &self.pool)
            .field("compiler", &self.compiler)
            .finish_non_exhaustive()
    }
}
