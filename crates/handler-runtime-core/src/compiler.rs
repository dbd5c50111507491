//! Handler compilation and the two-tier bytecode cache.
//!
//! `compile` wraps handler source in the engine's module template, compiles
//! it to QuickJS bytecode, and caches the result in memory (strict LRU) and
//! on disk (total-bytes bound, least-recently-used file evicted first).
//! Disk hits are promoted into memory.
//!
//! Cache keys hash the source together with [`BYTECODE_FORMAT_VERSION`] and
//! the crate version, so stale bytecode can never run after an upgrade that
//! changes the compiler's output format. Compile errors are terminal for the
//! request and are never cached.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use rquickjs::module::WriteOptions;
use rquickjs::{Context, Module, Runtime};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use handler_runtime_common::{CacheConfig, EngineError};

use crate::engine::JsEngine;
use crate::value::exception_parts;

/// Bumped whenever the module template or bytecode layout changes, which
/// invalidates every cached entry.
pub const BYTECODE_FORMAT_VERSION: u32 = 1;

/// File extension for disk-tier entries.
const DISK_EXTENSION: &str = "qjbc";

/// Module name used for every compiled handler.
///
/// Deliberately constant: the name is baked into the bytecode, and entries
/// are shared across handler ids with identical source.
const MODULE_NAME: &str = "handler";

/// Everything before the handler body: the host-error unwrap shim, the
/// suspension resolver registry with its `__resume` entry, and the
/// destructured host API the handler source sees.
const MODULE_PRELUDE: &str = r#"const __suspensions = Object.create(null);
let __native = null;
export function __bind(native) { __native = native; }
function __unwrap(r) {
  if (r && r.k === "err") {
    const e = new Error(r.message);
    e.code = r.code;
    throw e;
  }
  return r ? r.v : undefined;
}
export function __resume(id, ok, value) {
  const s = __suspensions[id];
  if (!s) throw new Error("unknown suspension: " + id);
  delete __suspensions[id];
  if (ok) {
    s.resolve(value);
  } else {
    const message = value && value.message ? value.message : String(value);
    const e = new Error(message);
    if (value && value.code) e.code = value.code;
    s.reject(e);
  }
}
export default async function (__input) {
"use strict";
const state = Object.freeze({
  get: (key) => __unwrap(__native.state_get(String(key))),
  has: (key) => __unwrap(__native.state_has(String(key))),
  set: (key, value) => __unwrap(__native.state_set(String(key), value === undefined ? null : value)),
  delete: (key) => __unwrap(__native.state_delete(String(key))),
  keys: () => __unwrap(__native.state_keys()),
});
const events = Object.freeze({
  emit: (name, payload) => __unwrap(__native.events_emit(String(name), payload === undefined ? null : payload)),
});
const view = Object.freeze({
  update: (component, command, params) => __unwrap(__native.view_update(String(component), String(command), params === undefined ? null : params)),
});
const log = Object.freeze({
  debug: (...parts) => __unwrap(__native.log_write("debug", parts.map(String).join(" "))),
  info: (...parts) => __unwrap(__native.log_write("info", parts.map(String).join(" "))),
  warn: (...parts) => __unwrap(__native.log_write("warn", parts.map(String).join(" "))),
  error: (...parts) => __unwrap(__native.log_write("error", parts.map(String).join(" "))),
});
const ext = new Proxy(Object.create(null), {
  get: (_target, name) => new Proxy(Object.create(null), {
    get: (_inner, method) => (...callArgs) => {
      const ticket = __unwrap(__native.ext_call(String(name), String(method), callArgs));
      return new Promise((resolve, reject) => {
        __suspensions[ticket.id] = { resolve, reject };
      });
    },
  }),
});
const args = __input.args;
const scope = __input.scope;
"#;

const MODULE_EPILOGUE: &str = "\n}\n";

/// Number of template lines preceding the handler source in a wrapped
/// module. Guest-reported line numbers subtract this so diagnostics point
/// into the handler source, not the template.
pub(crate) fn prelude_line_count() -> u32 {
    MODULE_PRELUDE.lines().count() as u32
}

/// Wrap handler source in the module template that binds the fixed set of
/// host-exposed names (`state`, `events`, `view`, `log`, `ext`, `args`,
/// `scope`).
pub fn wrap_source(source: &str) -> String {
    let mut wrapped =
        String::with_capacity(MODULE_PRELUDE.len() + source.len() + MODULE_EPILOGUE.len());
    wrapped.push_str(MODULE_PRELUDE);
    wrapped.push_str(source);
    wrapped.push_str(MODULE_EPILOGUE);
    wrapped
}

/// Cache key for a handler source: SHA-256 over the format version, the
/// crate version and the source text.
pub fn cache_key(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(BYTECODE_FORMAT_VERSION.to_le_bytes());
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A compiled handler: QuickJS module bytecode plus its cache key.
#[derive(Clone)]
pub struct CompiledHandler {
    key: String,
    bytecode: Vec<u8>,
    compiled_at: Instant,
}

impl CompiledHandler {
    /// Wrap caller-provided bytecode (the `execute_compiled` path).
    pub fn from_bytecode(bytecode: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&bytecode);
        let digest = hasher.finalize();
        Self {
            key: digest.iter().map(|b| format!("{b:02x}")).collect(),
            bytecode,
            compiled_at: Instant::now(),
        }
    }

    /// Cache key of this entry.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The module bytecode.
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// When this entry was produced or loaded.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }
}

impl std::fmt::Debug for CompiledHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledHandler")
            .field("key", &self.key)
            .field("bytecode_len", &self.bytecode.len())
            .finish_non_exhaustive()
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Entries in the memory tier.
    pub memory_entries: usize,
    /// Total bytecode bytes in the memory tier.
    pub memory_bytes: u64,
    /// Files in the disk tier.
    pub disk_entries: usize,
    /// Total bytes in the disk tier.
    pub disk_bytes: u64,
    /// Cache hits (either tier) since startup.
    pub hits: u64,
    /// Cache misses since startup.
    pub misses: u64,
}

/// Strict LRU memory tier, bounded by entry count and total bytes.
struct MemoryCache {
    entries: HashMap<String, Arc<CompiledHandler>>,
    recency: VecDeque<String>,
    total_bytes: u64,
    max_entries: usize,
    max_bytes: u64,
}

impl MemoryCache {
    fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            total_bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<CompiledHandler>> {
        let entry = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.to_string());
    }

    fn insert(&mut self, entry: Arc<CompiledHandler>) {
        if self.entries.contains_key(entry.key()) {
            self.touch(entry.key());
            return;
        }

        self.total_bytes += entry.bytecode().len() as u64;
        self.recency.push_back(entry.key().to_string());
        self.entries.insert(entry.key().to_string(), entry);

        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.total_bytes -= evicted.bytecode().len() as u64;
                debug!(key = %oldest, "Evicted bytecode from memory cache");
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Disk tier: `<key>.qjbc` files bounded by total bytes, oldest modified
/// time evicted first. Promotion refreshes the modified time so hot entries
/// survive eviction.
struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
}

impl DiskCache {
    fn new(dir: PathBuf, max_bytes: u64) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_bytes })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{DISK_EXTENSION}"))
    }

    fn load(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).ok()?;
        touch(&path);
        Some(bytes)
    }

    fn store(&self, key: &str, bytecode: &[u8]) -> Result<(), EngineError> {
        std::fs::write(self.path_for(key), bytecode)?;
        self.evict()?;
        Ok(())
    }

    /// Evict least-recently-used files until total bytes fit the ceiling.
    /// Ties on modified time break deterministically by file name.
    fn evict(&self) -> Result<(), EngineError> {
        let mut files = self.scan()?;
        let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
        if total <= self.max_bytes {
            return Ok(());
        }

        files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (path, _, len) in files {
            if total <= self.max_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "Evicted bytecode from disk cache");
                total -= len;
            }
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(PathBuf, SystemTime, u64)>, EngineError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DISK_EXTENSION) {
                continue;
            }
            let metadata = entry.metadata()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, modified, metadata.len()));
        }
        Ok(files)
    }

    fn stats(&self) -> (usize, u64) {
        match self.scan() {
            Ok(files) => (files.len(), files.iter().map(|(_, _, len)| len).sum()),
            Err(_) => (0, 0),
        }
    }
}

/// Refresh a file's modified time; failures only degrade eviction order.
fn touch(path: &Path) {
    if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}

/// Handler compiler with a two-tier bytecode cache.
///
/// The compiler owns a dedicated guest runtime used only for compilation;
/// instance runtimes never compile.
pub struct Compiler {
    _runtime: Runtime,
    context: Context,
    memory: Mutex<MemoryCache>,
    disk: Option<DiskCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Compiler {
    /// Create a compiler with the given cache configuration.
    pub fn new(engine: &JsEngine, config: &CacheConfig) -> Result<Self, EngineError> {
        let (runtime, _interrupt) = engine.create_runtime()?;
        let context = Context::full(&runtime)
            .map_err(|e| EngineError::internal(format!("failed to create compile context: {e}")))?;

        let disk = match &config.disk_dir {
            Some(dir) => Some(DiskCache::new(PathBuf::from(dir), config.disk_max_bytes)?),
            None => None,
        };

        Ok(Self {
            _runtime: runtime,
            context,
            memory: Mutex::new(MemoryCache::new(
                config.memory_max_entries,
                config.memory_max_bytes,
            )),
            disk,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Compile handler source, consulting both cache tiers first.
    ///
    /// Returns the compiled handler and whether it came from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Compilation`] for invalid source; compile
    /// errors are never cached.
    #[instrument(skip(self, source), fields(source_len = source.len()))]
    pub fn compile(&self, source: &str) -> Result<(Arc<CompiledHandler>, bool), EngineError> {
        let key = cache_key(source);

        if let Some(entry) = self.memory.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Bytecode memory cache hit");
            return Ok((entry, true));
        }

        if let Some(disk) = &self.disk {
            if let Some(bytecode) = disk.load(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Bytecode disk cache hit, promoting to memory");
                let entry = Arc::new(CompiledHandler {
                    key: key.clone(),
                    bytecode,
                    compiled_at: Instant::now(),
                });
                self.memory.lock().insert(Arc::clone(&entry));
                return Ok((entry, true));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let bytecode = self.compile_fresh(source)?;

        info!(
            key = %key,
            bytecode_len = bytecode.len(),
            duration_ms = start.elapsed().as_millis(),
            "Handler compiled"
        );

        let entry = Arc::new(CompiledHandler {
            key: key.clone(),
            bytecode,
            compiled_at: Instant::now(),
        });

        self.memory.lock().insert(Arc::clone(&entry));
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.store(&key, entry.bytecode()) {
                warn!(key = %key, error = %e, "Failed to store bytecode on disk");
            }
        }

        Ok((entry, false))
    }

    /// Compile the wrapped module without touching the cache.
    fn compile_fresh(&self, source: &str) -> Result<Vec<u8>, EngineError> {
        let wrapped = wrap_source(source);
        self.context.with(|ctx| {
            let module = match Module::declare(ctx.clone(), MODULE_NAME, wrapped) {
                Ok(module) => module,
                Err(error) => return Err(compilation_error(&ctx, &error)),
            };
            module
                .write(WriteOptions::default())
                .map_err(|e| EngineError::internal(format!("bytecode serialization failed: {e}")))
        })
    }

    /// Cache statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock();
        let (disk_entries, disk_bytes) = self.disk.as_ref().map_or((0, 0), DiskCache::stats);
        CacheStats {
            memory_entries: memory.len(),
            memory_bytes: memory.bytes(),
            disk_entries,
            disk_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let memory = self.memory.lock();
        f.debug_struct("Compiler")
            .field("memory_entries", &memory.len())
            .field("disk_enabled", &self.disk.is_some())
            .finish_non_exhaustive()
    }
}

/// Turn a failed module declaration into a compilation error with as much
/// location information as QuickJS reports.
fn compilation_error(ctx: &rquickjs::Ctx<'_>, error: &rquickjs::Error) -> EngineError {
    if matches!(error, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        let (message, _stack, _code) = exception_parts(&thrown);
        let line = thrown
            .as_object()
            .and_then(|o| o.get::<_, Option<i32>>("lineNumber").ok().flatten())
            .and_then(|l| u32::try_from(l).ok())
            // Reported against the wrapped module; shift into handler
            // coordinates and drop locations inside the template itself.
            .and_then(|l| l.checked_sub(prelude_line_count()))
            .filter(|l| *l >= 1);
        return EngineError::Compilation {
            message,
            line,
            column: None,
        };
    }
    EngineError::compilation(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use handler_runtime_common::EngineConfig;

    fn compiler_with(config: CacheConfig) -> Compiler {
        let engine = JsEngine::new(&EngineConfig::default()).unwrap();
        Compiler::new(&engine, &config).unwrap()
    }

    #[test]
    fn test_cache_key_is_stable_and_source_sensitive() {
        let a = cache_key("return 1;");
        let b = cache_key("return 1;");
        let c = cache_key("return 2;");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // SHA-256 hex
    }

    #[test]
    fn test_wrap_source_binds_host_names() {
        let wrapped = wrap_source("return state.get('count');");
        assert!(wrapped.contains("const state"));
        assert!(wrapped.contains("const events"));
        assert!(wrapped.contains("const ext"));
        assert!(wrapped.contains("return state.get('count');"));
        assert!(wrapped.contains("export function __resume"));
    }

    #[test]
    fn test_compile_hits_memory_cache_with_identical_bytecode() {
        let compiler = compiler_with(CacheConfig::default());

        let (first, hit_first) = compiler.compile("return 1 + 2;").unwrap();
        let (second, hit_second) = compiler.compile("return 1 + 2;").unwrap();

        assert!(!hit_first);
        assert!(hit_second);
        assert_eq!(first.bytecode(), second.bytecode());
        assert_eq!(first.key(), second.key());

        let stats = compiler.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_compile_error_is_not_cached() {
        let compiler = compiler_with(CacheConfig::default());

        let err = compiler.compile("return ][;").unwrap_err();
        assert!(matches!(err, EngineError::Compilation { .. }));

        let stats = compiler.stats();
        assert_eq!(stats.memory_entries, 0);

        // Still a miss on retry, never a cache hit for bad source.
        let err = compiler.compile("return ][;").unwrap_err();
        assert!(matches!(err, EngineError::Compilation { .. }));
    }

    #[test]
    fn test_disk_tier_promotes_and_survives_memory_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            memory_max_entries: 1,
            disk_dir: Some(dir.path().display().to_string()),
            ..Default::default()
        };
        let compiler = compiler_with(config);

        let (first, _) = compiler.compile("return 'a';").unwrap();
        // Evicts 'a' from the single-entry memory tier.
        compiler.compile("return 'b';").unwrap();

        let (again, hit) = compiler.compile("return 'a';").unwrap();
        assert!(hit, "expected disk hit after memory eviction");
        assert_eq!(first.bytecode(), again.bytecode());
    }

    #[test]
    fn test_disk_eviction_bounded_by_total_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            disk_dir: Some(dir.path().display().to_string()),
            disk_max_bytes: 1, // everything evicts after store
            ..Default::default()
        };
        let compiler = compiler_with(config);

        compiler.compile("return 'a';").unwrap();
        compiler.compile("return 'b';").unwrap();

        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(remaining <= 1, "disk tier kept {remaining} oversized entries");
    }

    #[test]
    fn test_memory_lru_eviction_order() {
        let mut cache = MemoryCache::new(2, u64::MAX);
        let a = Arc::new(CompiledHandler::from_bytecode(vec![1]));
        let b = Arc::new(CompiledHandler::from_bytecode(vec![2]));
        let c = Arc::new(CompiledHandler::from_bytecode(vec![3]));

        cache.insert(Arc::clone(&a));
        cache.insert(Arc::clone(&b));
        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.get(a.key()).is_some());
        cache.insert(Arc::clone(&c));

        assert!(cache.get(a.key()).is_some());
        assert!(cache.get(b.key()).is_none());
        assert!(cache.get(c.key()).is_some());
    }

    #[test]
    fn test_from_bytecode_key_is_content_addressed() {
        let a = CompiledHandler::from_bytecode(vec![1, 2, 3]);
        let b = CompiledHandler::from_bytecode(vec![1, 2, 3]);
        let c = CompiledHandler::from_bytecode(vec![9]);

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }
}
