//! CBOR wire schema for the FFI boundary.
//!
//! Every structured payload crossing the boundary is CBOR with camelCase
//! field names. Decoding is strict about shape but forgiving about
//! capability strings: malformed tokens grant nothing, matching the
//! capability model's parse semantics.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use handler_runtime_common::{Capability, EngineError};
use handler_runtime_core::{
    EmittedEvent, ErrorDetail, ExecutionRequest, ExecutionResult, ExecutionStatus, LogEntry,
    StateMutation, SuspensionState, ValueMap, ViewCommand,
};

/// Encode a wire value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| EngineError::serialization(format!("CBOR encode: {e}")))?;
    Ok(buffer)
}

/// Decode a wire value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    ciborium::from_reader(bytes)
        .map_err(|e| EngineError::serialization(format!("CBOR decode: {e}")))
}

/// One extension declaration on a wire request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireExtension {
    /// Methods callable through the suspend protocol.
    pub methods: Vec<String>,
}

/// Inbound execution request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireRequest {
    /// Handler identifier.
    pub handler_id: String,
    /// Read-only state snapshot.
    pub state: ValueMap,
    /// Input arguments.
    pub args: ValueMap,
    /// Granted capability strings; malformed entries grant nothing.
    pub capabilities: Vec<String>,
    /// Optional lexical scope.
    pub scope: Option<ValueMap>,
    /// Available extensions.
    pub extensions: BTreeMap<String, WireExtension>,
    /// Per-request timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl WireRequest {
    /// Convert into the engine's request type.
    pub fn into_request(self) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(self.handler_id);
        request.state = self.state;
        request.args = self.args;
        request.capabilities = self
            .capabilities
            .iter()
            .filter_map(|raw| Capability::parse(raw))
            .collect();
        request.scope = self.scope;
        for (name, extension) in self.extensions {
            request.extensions.register(name, extension.methods);
        }
        request.timeout_ms = self.timeout_ms;
        request
    }
}

/// Metrics on a wire result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMetrics {
    /// VM segment wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Guest memory high-water mark in bytes.
    pub memory_peak_bytes: u64,
    /// Host calls made so far in this execution.
    pub host_calls: u32,
    /// Whether the bytecode came from the cache.
    pub cache_hit: bool,
}

/// Outbound execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResult {
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Handler return value on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Ordered state mutations for the host to apply.
    pub mutations: Vec<StateMutation>,
    /// Emitted events for the host to dispatch.
    pub events: Vec<EmittedEvent>,
    /// View commands for the host to act on.
    pub commands: Vec<ViewCommand>,
    /// Guest log entries.
    pub logs: Vec<LogEntry>,
    /// Suspension details when suspended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionState>,
    /// Structured error when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Execution metrics.
    pub metrics: WireMetrics,
}

impl From<ExecutionResult> for WireResult {
    fn from(result: ExecutionResult) -> Self {
        Self {
            status: result.status,
            value: result.value,
            mutations: result.effects.mutations,
            events: result.effects.events,
            commands: result.effects.commands,
            logs: result.effects.logs,
            suspension: result.suspension,
            error: result.error,
            metrics: WireMetrics {
                duration_ms: result.metrics.duration.as_millis() as u64,
                memory_peak_bytes: result.metrics.memory_peak_bytes,
                host_calls: result.metrics.host_calls,
                cache_hit: result.metrics.cache_hit,
            },
        }
    }
}

/// Inferred capability tokens, for the advisory inference entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCapabilities {
    /// Canonical token strings.
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip_and_conversion() {
        let mut wire = WireRequest {
            handler_id: "on-click".into(),
            capabilities: vec![
                "state:read:count".into(),
                "ext:http".into(),
                "garbage-token".into(),
            ],
            timeout_ms: Some(250),
            ..Default::default()
        };
        wire.state.insert("count".into(), json!(1));
        wire.args.insert("delta".into(), json!(2));
        wire.extensions.insert(
            "http".into(),
            WireExtension {
                methods: vec!["get".into()],
            },
        );

        let bytes = encode(&wire).unwrap();
        let decoded: WireRequest = decode(&bytes).unwrap();
        assert_eq!(decoded.handler_id, "on-click");
        assert_eq!(decoded.timeout_ms, Some(250));

        let request = decoded.into_request();
        assert_eq!(request.handler_id, "on-click");
        assert_eq!(request.state.get("count"), Some(&json!(1)));
        // The malformed capability was dropped, not widened.
        assert_eq!(request.capabilities.len(), 2);
        assert!(request.extensions.has_method("http", "get"));
        assert_eq!(request.timeout_ms, Some(250));
    }

    #[test]
    fn test_missing_fields_default() {
        let wire = WireRequest {
            handler_id: "minimal".into(),
            ..Default::default()
        };
        let bytes = encode(&wire).unwrap();
        let decoded: WireRequest = decode(&bytes).unwrap();

        assert!(decoded.state.is_empty());
        assert!(decoded.capabilities.is_empty());
        assert!(decoded.timeout_ms.is_none());
    }

    #[test]
    fn test_result_serialization_shape() {
        use handler_runtime_core::{Effects, ExecutionMetrics};

        let mut effects = Effects::default();
        effects.mutations.push(StateMutation::Set {
            key: "count".into(),
            value: json!(2),
        });

        let result = ExecutionResult::success(
            json!(42),
            effects,
            ExecutionMetrics {
                duration: std::time::Duration::from_millis(7),
                memory_peak_bytes: 1024,
                host_calls: 3,
                cache_hit: true,
            },
        );

        let wire = WireResult::from(result);
        let bytes = encode(&wire).unwrap();
        let decoded: WireResult = decode(&bytes).unwrap();

        assert_eq!(decoded.status, ExecutionStatus::Success);
        assert_eq!(decoded.value, Some(json!(42)));
        assert_eq!(decoded.mutations.len(), 1);
        assert_eq!(decoded.metrics.duration_ms, 7);
        assert!(decoded.metrics.cache_hit);
        assert!(decoded.error.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode::<WireRequest>(&[0xff, 0x00, 0x13]);
        assert!(result.is_err());
    }
}
