//! Instance pool: lifecycle management under a concurrency ceiling.
//!
//! The pool owns every [`Instance`]. Admission control is a tokio
//! [`Semaphore`] sized to the configured maximum: Active + Suspended
//! instances never exceed it, and excess `acquire` calls queue instead of
//! spawning unbounded VMs. Idle instances are reused LIFO for cache
//! locality; suspended instances move into a side index keyed by
//! suspension id, keeping their pool permit until resumed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use handler_runtime_common::{EngineError, PoolConfig};

use crate::engine::JsEngine;
use crate::instance::{HostBinder, Instance, InstanceState};

/// An instance checked out of the pool, together with the permit that
/// holds its concurrency slot.
pub struct PoolLease {
    /// The borrowed instance.
    pub instance: Instance,
    pub(crate) permit: OwnedSemaphorePermit,
}

impl PoolLease {
    /// Split the lease for handing the instance to a blocking task.
    pub(crate) fn into_parts(self) -> (Instance, OwnedSemaphorePermit) {
        (self.instance, self.permit)
    }

    pub(crate) fn from_parts(instance: Instance, permit: OwnedSemaphorePermit) -> Self {
        Self { instance, permit }
    }
}

struct SuspendedEntry {
    instance: Instance,
    permit: OwnedSemaphorePermit,
    since: Instant,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Idle instances available for reuse.
    pub idle: usize,
    /// Instances bound to in-flight executions.
    pub active: usize,
    /// Instances parked awaiting async results.
    pub suspended: usize,
    /// Configured concurrency ceiling.
    pub max_instances: usize,
    /// Instances created since startup.
    pub created_total: u64,
    /// Aggregate guest memory high-water across reachable instances.
    pub aggregate_memory_bytes: u64,
}

/// Owns and recycles guest VM instances.
pub struct InstancePool {
    engine: JsEngine,
    binder: HostBinder,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Instance>>,
    suspended: DashMap<String, SuspendedEntry>,
    shutting_down: AtomicBool,
    max_instances: usize,
    max_idle: usize,
    active: AtomicUsize,
    created_total: AtomicU64,
}

impl InstancePool {
    /// Create a pool, eagerly warming `min_instances` idle VMs.
    pub fn new(
        config: &PoolConfig,
        engine: JsEngine,
        binder: HostBinder,
    ) -> Result<Self, EngineError> {
        if config.max_instances == 0 {
            return Err(EngineError::invalid_config(
                "max_instances must be greater than zero",
            ));
        }
        if config.min_instances > config.max_instances {
            return Err(EngineError::invalid_config(
                "min_instances cannot exceed max_instances",
            ));
        }

        let pool = Self {
            engine,
            binder,
            semaphore: Arc::new(Semaphore::new(config.max_instances)),
            idle: Mutex::new(Vec::new()),
            suspended: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            max_instances: config.max_instances,
            max_idle: config.max_idle,
            active: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
        };

        {
            let mut idle = pool.idle.lock();
            for _ in 0..config.min_instances {
                idle.push(pool.create_instance()?);
            }
        }

        info!(
            min_instances = config.min_instances,
            max_instances = config.max_instances,
            "Instance pool initialized"
        );
        Ok(pool)
    }

    fn create_instance(&self) -> Result<Instance, EngineError> {
        let instance = Instance::new(&self.engine, Arc::clone(&self.binder))?;
        self.created_total.fetch_add(1, Ordering::Relaxed);
        Ok(instance)
    }

    /// Borrow an instance, waiting for a slot when Active + Suspended is at
    /// the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] once `shutdown` has started.
    pub async fn acquire(&self) -> Result<PoolLease, EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;

        let instance = match self.idle.lock().pop() {
            Some(instance) => instance,
            None => self.create_instance()?,
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(PoolLease { instance, permit })
    }

    /// Return an instance to the pool, resetting guest-visible state.
    ///
    /// Terminated instances are dropped; idle overflow beyond `max_idle` is
    /// terminated instead of retained.
    pub fn release(&self, lease: PoolLease) {
        let PoolLease {
            mut instance,
            permit,
        } = lease;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if instance.state() != InstanceState::Terminated {
            instance.reset();
            let mut idle = self.idle.lock();
            if !self.shutting_down.load(Ordering::SeqCst) && idle.len() < self.max_idle {
                idle.push(instance);
            } else {
                instance.terminate();
            }
        }
        drop(permit);
    }

    /// Terminate a leased instance and free its slot.
    pub fn terminate(&self, lease: PoolLease) {
        let PoolLease {
            mut instance,
            permit,
        } = lease;
        self.active.fetch_sub(1, Ordering::SeqCst);
        instance.terminate();
        drop(permit);
    }

    /// Park a suspended instance in the suspension index. The instance
    /// keeps its pool slot until resumed or shut down.
    pub fn suspend(&self, lease: PoolLease, suspension_id: String) -> Result<(), EngineError> {
        let PoolLease { instance, permit } = lease;
        if instance.state() != InstanceState::Suspended {
            let mut instance = instance;
            let state = instance.state();
            instance.terminate();
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::internal(format!(
                "instance {} parked while {state}, expected suspended",
                instance.id()
            )));
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(suspension_id = %suspension_id, instance_id = instance.id(), "Instance parked");
        self.suspended.insert(
            suspension_id,
            SuspendedEntry {
                instance,
                permit,
                since: Instant::now(),
            },
        );
        Ok(())
    }

    /// Look up and remove a suspended instance by suspension id.
    ///
    /// Suspension ids are single-use: a second call with the same id fails
    /// with [`EngineError::SuspensionNotFound`].
    pub fn take_suspended(&self, suspension_id: &str) -> Result<PoolLease, EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let (_, entry) = self.suspended.remove(suspension_id).ok_or_else(|| {
            EngineError::SuspensionNotFound {
                suspension_id: suspension_id.to_string(),
            }
        })?;

        debug!(
            suspension_id = %suspension_id,
            instance_id = entry.instance.id(),
            suspended_ms = entry.since.elapsed().as_millis(),
            "Instance unparked"
        );
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(PoolLease {
            instance: entry.instance,
            permit: entry.permit,
        })
    }

    /// Drain and terminate every instance; subsequent acquires fail.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.semaphore.close();

        let mut drained = 0usize;
        for mut instance in self.idle.lock().drain(..) {
            instance.terminate();
            drained += 1;
        }

        let keys: Vec<String> = self.suspended.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, mut entry)) = self.suspended.remove(&key) {
                entry.instance.terminate();
                drained += 1;
                warn!(suspension_id = %key, "Suspension abandoned at shutdown");
            }
        }

        info!(drained, "Instance pool shut down");
    }

    /// Whether `shutdown` has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Pool statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock();
        let idle_memory: u64 = idle.iter().map(Instance::memory_high_water).sum();
        let suspended_memory: u64 = self
            .suspended
            .iter()
            .map(|entry| entry.instance.memory_high_water())
            .sum();

        PoolStats {
            idle: idle.len(),
            active: self.active.load(Ordering::SeqCst),
            suspended: self.suspended.len(),
            max_instances: self.max_instances,
            created_total: self.created_total.load(Ordering::Relaxed),
            aggregate_memory_bytes: idle_memory + suspended_memory,
        }
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("max_instances", &self.max_instances)
            .field("idle", &self.idle.lock().len())
            .field("suspended", &self.suspended.len())
            .finish_non_exhaustive()
    }
}
