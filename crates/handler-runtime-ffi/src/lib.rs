//! C ABI boundary adapter for handler-runtime.
//!
//! This crate is the only marshaling point between host-native memory and
//! the engine. Every structured payload crosses as a CBOR buffer; output
//! buffers are allocated by the engine and must be released through
//! [`handler_rt_buffer_free`]. The engine core never holds references into
//! host memory; each crossing copies.
//!
//! Engine-level failures return a non-`Ok` [`FfiErrorCode`]; the message is
//! retrievable via `handler_rt_last_error` on the same thread. In-run
//! failures (permission denials, traps, timeouts) are not FFI errors:
//! they arrive inside the serialized execution result with `status =
//! "error"`.

#![allow(unsafe_code)]

pub mod error;
pub mod wire;

use std::ffi::{CStr, c_char};

use tokio::runtime::Builder;

use handler_runtime_common::{EngineError, RuntimeConfig};
use handler_runtime_core::{AsyncCallResult, HandlerRuntime};
use handler_runtime_host::{create_runtime, infer_capabilities};

use crate::error::{FfiError, FfiErrorCode, clear_last_error};
use crate::wire::{WireCapabilities, WireRequest, WireResult, decode, encode};

/// An engine instance plus the tokio runtime that drives it.
pub struct EngineHandle {
    runtime: tokio::runtime::Runtime,
    engine: HandlerRuntime,
}

impl EngineHandle {
    fn new(config: RuntimeConfig) -> Result<Box<Self>, FfiError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("handler-rt")
            .enable_all()
            .build()
            .map_err(|e| FfiError {
                code: FfiErrorCode::Internal,
                message: format!("failed to build runtime: {e}"),
            })?;
        let engine = create_runtime(config).map_err(FfiError::from)?;
        Ok(Box::new(Self { runtime, engine }))
    }
}

/// Engine-owned byte buffer handed across the boundary.
///
/// Release with [`handler_rt_buffer_free`]; never with the host allocator.
#[repr(C)]
pub struct ByteBuffer {
    /// Buffer start; null for the empty buffer.
    pub ptr: *mut u8,
    /// Valid byte count.
    pub len: usize,
    /// Allocation capacity, needed to release.
    pub cap: usize,
}

impl ByteBuffer {
    fn from_vec(mut bytes: Vec<u8>) -> Self {
        let buffer = Self {
            ptr: bytes.as_mut_ptr(),
            len: bytes.len(),
            cap: bytes.capacity(),
        };
        std::mem::forget(bytes);
        buffer
    }
}

/// Read a `(ptr, len)` pair as a byte slice, rejecting null pointers for
/// non-empty lengths.
unsafe fn slice_arg<'a>(ptr: *const u8, len: usize) -> Result<&'a [u8], FfiError> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(FfiError::invalid_argument("null buffer pointer"));
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
}

unsafe fn str_arg<'a>(ptr: *const u8, len: usize) -> Result<&'a str, FfiError> {
    let bytes = unsafe { slice_arg(ptr, len) }?;
    std::str::from_utf8(bytes).map_err(|_| FfiError::invalid_argument("invalid utf-8 string"))
}

fn write_result(
    out: *mut ByteBuffer,
    result: Result<Vec<u8>, EngineError>,
) -> Result<(), FfiError> {
    let bytes = result.map_err(FfiError::from)?;
    if out.is_null() {
        return Err(FfiError::invalid_argument("null output buffer"));
    }
    unsafe { out.write(ByteBuffer::from_vec(bytes)) };
    Ok(())
}

/// Create an engine.
///
/// `config_ptr`/`config_len` may describe a CBOR-encoded [`RuntimeConfig`];
/// pass a zero length for defaults. On success the handle is written to
/// `out_engine`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_engine_new(
    config_ptr: *const u8,
    config_len: usize,
    out_engine: *mut Box<EngineHandle>,
) -> FfiErrorCode {
    clear_last_error();
    if out_engine.is_null() {
        return error::set_last_error(&FfiError::invalid_argument("null output handle"));
    }

    let config = if config_len == 0 {
        RuntimeConfig::default()
    } else {
        let bytes = c_try!(unsafe { slice_arg(config_ptr, config_len) });
        c_try!(decode::<RuntimeConfig>(bytes))
    };

    let handle = c_try!(EngineHandle::new(config));
    unsafe { out_engine.write(handle) };
    FfiErrorCode::Ok
}

/// Destroy an engine, draining its pool first.
#[unsafe(no_mangle)]
pub extern "C" fn handler_rt_engine_destroy(engine: Box<EngineHandle>) {
    engine.engine.shutdown();
}

/// Reject new work; in-flight executions finish, suspensions are dropped.
#[unsafe(no_mangle)]
pub extern "C" fn handler_rt_shutdown(engine: &EngineHandle) {
    engine.engine.shutdown();
}

/// Compile (or fetch from cache) and execute handler source against a
/// CBOR-encoded request; the result is written as a CBOR buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_execute(
    engine: &EngineHandle,
    source_ptr: *const u8,
    source_len: usize,
    request_ptr: *const u8,
    request_len: usize,
    out_result: *mut ByteBuffer,
) -> FfiErrorCode {
    clear_last_error();
    let source = c_try!(unsafe { str_arg(source_ptr, source_len) });
    let request_bytes = c_try!(unsafe { slice_arg(request_ptr, request_len) });
    let request = c_try!(decode::<WireRequest>(request_bytes)).into_request();

    let result = c_try!(
        engine
            .runtime
            .block_on(engine.engine.execute(source, request))
            .map_err(FfiError::from)
    );
    c_try!(write_result(out_result, encode(&WireResult::from(result))));
    FfiErrorCode::Ok
}

/// Execute previously compiled bytecode.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_execute_compiled(
    engine: &EngineHandle,
    bytecode_ptr: *const u8,
    bytecode_len: usize,
    request_ptr: *const u8,
    request_len: usize,
    out_result: *mut ByteBuffer,
) -> FfiErrorCode {
    clear_last_error();
    let bytecode = c_try!(unsafe { slice_arg(bytecode_ptr, bytecode_len) }).to_vec();
    let request_bytes = c_try!(unsafe { slice_arg(request_ptr, request_len) });
    let request = c_try!(decode::<WireRequest>(request_bytes)).into_request();

    let result = c_try!(
        engine
            .runtime
            .block_on(engine.engine.execute_compiled(bytecode, request))
            .map_err(FfiError::from)
    );
    c_try!(write_result(out_result, encode(&WireResult::from(result))));
    FfiErrorCode::Ok
}

/// Compile handler source to bytecode without executing it. The raw
/// bytecode is written to `out_bytecode`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_precompile(
    engine: &EngineHandle,
    source_ptr: *const u8,
    source_len: usize,
    out_bytecode: *mut ByteBuffer,
) -> FfiErrorCode {
    clear_last_error();
    let source = c_try!(unsafe { str_arg(source_ptr, source_len) });
    c_try!(write_result(out_bytecode, engine.engine.precompile(source)));
    FfiErrorCode::Ok
}

/// Deliver an asynchronous result to a suspended execution. The
/// continuation's result is written as a CBOR buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_resume(
    engine: &EngineHandle,
    suspension_id: *const c_char,
    result_ptr: *const u8,
    result_len: usize,
    out_result: *mut ByteBuffer,
) -> FfiErrorCode {
    clear_last_error();
    if suspension_id.is_null() {
        return error::set_last_error(&FfiError::invalid_argument("null suspension id"));
    }
    let suspension_id = match unsafe { CStr::from_ptr(suspension_id) }.to_str() {
        Ok(id) => id,
        Err(_) => {
            return error::set_last_error(&FfiError::invalid_argument(
                "suspension id is not valid utf-8",
            ));
        }
    };
    let result_bytes = c_try!(unsafe { slice_arg(result_ptr, result_len) });
    let async_result = c_try!(decode::<AsyncCallResult>(result_bytes));

    let result = c_try!(
        engine
            .runtime
            .block_on(engine.engine.resume(suspension_id, async_result))
            .map_err(FfiError::from)
    );
    c_try!(write_result(out_result, encode(&WireResult::from(result))));
    FfiErrorCode::Ok
}

/// Pool, cache and engine statistics as a CBOR buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_stats(
    engine: &EngineHandle,
    out_stats: *mut ByteBuffer,
) -> FfiErrorCode {
    clear_last_error();
    let stats = engine.engine.stats();
    c_try!(write_result(out_stats, encode(&stats)));
    FfiErrorCode::Ok
}

/// Advisory capability inference over handler source; returns canonical
/// token strings as a CBOR buffer. Never used for enforcement.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn handler_rt_infer_capabilities(
    source_ptr: *const u8,
    source_len: usize,
    out_capabilities: *mut ByteBuffer,
) -> FfiErrorCode {
    clear_last_error();
    let source = c_try!(unsafe { str_arg(source_ptr, source_len) });
    let capabilities = WireCapabilities {
        capabilities: infer_capabilities(source)
            .iter()
            .map(|c| c.canonical())
            .collect(),
    };
    c_try!(write_result(out_capabilities, encode(&capabilities)));
    FfiErrorCode::Ok
}

/// Release a buffer previously written by this crate.
#[unsafe(no_mangle)]
pub extern "C" fn handler_rt_buffer_free(buffer: ByteBuffer) {
    if buffer.ptr.is_null() {
        return;
    }
    // SAFETY: the buffer was produced by ByteBuffer::from_vec and has not
    // been freed before; reconstructing the Vec releases the allocation.
    drop(unsafe { Vec::from_raw_parts(buffer.ptr, buffer.len, buffer.cap) });
}
