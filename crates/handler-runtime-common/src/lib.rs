//! Common types, errors, and utilities for handler-runtime.
//!
//! This crate provides shared functionality used across the handler-runtime
//! workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings
//! - The capability token model shared by the request contract and the
//!   host function layer

pub mod capability;
pub mod config;
pub mod config_file;
pub mod error;

pub use capability::{Capability, CapabilityChecker, CapabilityScope};
pub use config::{CacheConfig, EngineConfig, ExecutionConfig, PoolConfig, RuntimeConfig};
pub use error::{EngineError, ResourceKind};
