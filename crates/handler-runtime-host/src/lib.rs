//! Host functions implementation for handler-runtime.
//!
//! This crate provides the only API surface exposed to guest code. Each
//! host function family checks the execution's granted capabilities before
//! recording any side effect into the execution context:
//!
//! - [`state`]: snapshot reads and mutation recording
//! - [`events`]: event emission
//! - [`view`]: UI commands against component ids
//! - [`logging`]: always-permitted structured logging
//! - [`extension`]: asynchronous extension calls via the suspend protocol
//!
//! [`infer`] is the companion static-analysis pass: advisory capability
//! inference for developer tooling, deliberately separate from enforcement.
//!
//! # Security Model
//!
//! 1. **Capabilities**: by default nothing is allowed; each call requires
//!    an explicitly granted token.
//! 2. **Host-call ceiling**: every call counts against a per-execution
//!    limit, bounding handlers that loop over host calls.
//! 3. **Copy-based exchange**: values cross the boundary as data; no host
//!    reference ever reaches the guest.

pub mod events;
pub mod extension;
pub mod infer;
pub mod logging;
pub mod registry;
pub mod state;
pub mod view;

pub use infer::infer_capabilities;
pub use registry::{create_runtime, host_binder, install_native};
