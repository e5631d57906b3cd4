// ABOUTME: JSON-RPC 2.0 envelopes and method payloads for the shellcast wire protocol
// ABOUTME: Requests in, responses/errors/notifications out, output chunks as text or base64

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shellcast_core::error::codes;
use shellcast_core::{
    CompletionStatus, ExecError, HookOutcome, Origin, OutputChunk, ProcessState, SessionId,
};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Methods a client may call, advertised in the `connected` notification.
pub const CAPABILITIES: &[&str] = &["execute", "cancel", "control", "status", "stream", "hooks", "json_mode"];

/// Notification method names.
pub mod method {
    pub const CONNECTED: &str = "connected";
    pub const PROCESS_STARTED: &str = "process.started";
    pub const PROCESS_OUTPUT: &str = "process.output";
    pub const PROCESS_PAUSED: &str = "process.paused";
    pub const PROCESS_RESUMED: &str = "process.resumed";
}

/// Inbound request. A missing id is answered with `id: null`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    /// Decode one text frame.
    ///
    /// On failure returns the id (when one could be recovered) and the error to send.
    pub fn parse(text: &str) -> Result<Self, (Value, RpcError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (Value::Null, RpcError::new(codes::PARSE_ERROR, format!("parse error: {e}"))))?;
        let id = value.get("id").cloned().unwrap_or(Value::Null);

        let request: RpcRequest = serde_json::from_value(value)
            .map_err(|e| (id.clone(), RpcError::from(&ExecError::ProtocolError(e.to_string()))))?;

        if let Some(version) = &request.jsonrpc {
            if version != JSONRPC_VERSION {
                let err = ExecError::ProtocolError(format!("unsupported jsonrpc version {version:?}"));
                return Err((id, RpcError::from(&err)));
            }
        }
        Ok(request)
    }

    /// Deserialize params into `T`, mapping failures to `InvalidParams`.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, ExecError> {
        let params = if self.params.is_null() {
            Value::Object(Default::default())
        } else {
            self.params.clone()
        };
        serde_json::from_value(params).map_err(|e| ExecError::InvalidParams(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        let data = self.data.get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = data {
            map.insert(key.to_string(), value);
        }
        self
    }
}

impl From<&ExecError> for RpcError {
    fn from(err: &ExecError) -> Self {
        RpcError::new(err.code(), err.to_string()).with_data("kind", Value::String(err.kind().into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification<P> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: P,
}

impl<P: Serialize> Notification<P> {
    pub fn new(method: &'static str, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

// ── Request params ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteParams {
    pub command: String,
    /// Seconds; fractional values allowed.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub json_mode: bool,
    /// Free-form task description handed to hooks.
    #[serde(default)]
    pub description: Option<String>,
}

impl ExecuteParams {
    pub fn timeout(&self) -> Result<Option<Duration>, ExecError> {
        match self.timeout {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(secs) => Err(ExecError::InvalidParams(format!(
                "timeout must be a positive number of seconds, got {secs}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlAction {
    #[serde(alias = "pause")]
    Pause,
    #[serde(alias = "resume")]
    Resume,
    #[serde(alias = "cancel")]
    Cancel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlParams {
    #[serde(rename = "type")]
    pub action: ControlAction,
}

// ── Notification params ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedParams {
    pub session_id: SessionId,
    pub version: &'static str,
    pub capabilities: &'static [&'static str],
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedParams {
    pub session_id: SessionId,
    pub request_id: Value,
    pub pid: u32,
    pub pgid: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSignalParams {
    pub session_id: SessionId,
    pub request_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputParams {
    pub session_id: SessionId,
    pub request_id: Value,
    pub origin: Origin,
    pub seq: u64,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<&'static str>,
}

impl OutputParams {
    /// Text chunks are sent as-is; anything that is not UTF-8 goes as base64.
    pub fn from_chunk(session_id: SessionId, request_id: Value, chunk: OutputChunk) -> Self {
        let (data, encoding) = match String::from_utf8(chunk.data) {
            Ok(text) => (text, None),
            Err(e) => (
                base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
                Some("base64"),
            ),
        };
        Self {
            session_id,
            request_id,
            origin: chunk.origin,
            seq: chunk.seq,
            data,
            encoding,
        }
    }
}

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct HookReport {
    pub pre: Vec<HookOutcome>,
    pub post: Vec<HookOutcome>,
}

/// Terminal result of an `execute` request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub session_id: SessionId,
    pub status: CompletionStatus,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub pid: Option<u32>,
    pub duration_ms: u64,
    pub timeout_secs: f64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub stdout_chunks: u64,
    pub stderr_chunks: u64,
    /// False when a stream read failed and output is partial.
    pub capture_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub hooks: HookReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResult {
    pub status: &'static str,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rejects_garbage_with_parse_error() {
        let (id, err) = RpcRequest::parse("{not json").expect_err("invalid");
        assert_eq!(id, Value::Null);
        assert_eq!(err.code, codes::PARSE_ERROR);
    }

    #[test]
    fn parse_keeps_id_when_envelope_is_wrong() {
        let (id, err) = RpcRequest::parse(r#"{"jsonrpc":"2.0","id":9}"#).expect_err("no method");
        assert_eq!(id, json!(9));
        assert_eq!(err.code, codes::INVALID_REQUEST);

        let (_, err) =
            RpcRequest::parse(r#"{"jsonrpc":"1.0","method":"execute","id":1}"#).expect_err("version");
        assert_eq!(err.code, codes::INVALID_REQUEST);
    }

    #[test]
    fn execute_params_validate_timeout() {
        let req = RpcRequest::parse(
            r#"{"jsonrpc":"2.0","method":"execute","id":"a","params":{"command":"ls","timeout":1.5}}"#,
        )
        .expect("valid");
        let params: ExecuteParams = req.params().expect("params");
        assert_eq!(params.timeout().expect("ok"), Some(Duration::from_millis(1500)));

        let bad = ExecuteParams {
            timeout: Some(-1.0),
            ..params
        };
        assert!(matches!(bad.timeout(), Err(ExecError::InvalidParams(_))));
    }

    #[test]
    fn missing_params_are_invalid_params() {
        let req = RpcRequest::parse(r#"{"jsonrpc":"2.0","method":"execute","id":1}"#).expect("valid");
        let err = req.params::<ExecuteParams>().expect_err("command missing");
        assert_eq!(err.code(), codes::INVALID_PARAMS);
    }

    #[test]
    fn control_accepts_upper_and_lower_case() {
        let upper: ControlParams = serde_json::from_value(json!({"type": "PAUSE"})).expect("upper");
        let lower: ControlParams = serde_json::from_value(json!({"type": "resume"})).expect("lower");
        assert_eq!(upper.action, ControlAction::Pause);
        assert_eq!(lower.action, ControlAction::Resume);
    }

    #[test]
    fn binary_chunks_are_base64() {
        let sid = SessionId::from("s");
        let text = OutputParams::from_chunk(
            sid.clone(),
            json!(1),
            OutputChunk {
                origin: Origin::Stdout,
                seq: 0,
                data: b"hello".to_vec(),
            },
        );
        assert_eq!(text.data, "hello");
        assert!(text.encoding.is_none());

        let binary = OutputParams::from_chunk(
            sid,
            json!(1),
            OutputChunk {
                origin: Origin::Stderr,
                seq: 3,
                data: vec![0xff, 0x00, 0xfe],
            },
        );
        assert_eq!(binary.encoding, Some("base64"));
        assert_eq!(binary.data, "/wD+");
        let value = serde_json::to_value(&binary).expect("serialize");
        assert_eq!(value["origin"], "stderr");
        assert_eq!(value["seq"], 3);
    }

    #[test]
    fn exec_errors_carry_kind() {
        let err = RpcError::from(&ExecError::SessionBusy("s".into()));
        assert_eq!(err.code, codes::SESSION_BUSY);
        assert_eq!(err.data, Some(json!({"kind": "SessionBusy"})));
    }
}
