// ABOUTME: Protocol engine - one task per WebSocket connection, one per execution
// ABOUTME: Dispatches JSON-RPC methods and wraps every execution in pre/post hooks

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shellcast_core::error::codes;
use shellcast_core::{
    CompletionEvent, CompletionResult, CompletionStatus, Config, EventSink, ExecError, ExecRequest,
    HookContext, HookOutcome, HookPhase, HookRunner, LeaseToken, OutputPostProcessor, ProcessState,
    ProcessSupervisor, SessionId, SessionManager,
};

use crate::protocol::{
    method, CancelResult, ConnectedParams, ControlAction, ControlParams, ExecuteParams,
    ExecuteResult, HookReport, Notification, OutputParams, ProcessSignalParams, RpcError,
    RpcRequest, RpcResponse, StartedParams, CAPABILITIES, PROTOCOL_VERSION,
};

/// Frames queued for the socket writer.
const OUTBOUND_BUFFER: usize = 256;
/// Output chunks buffered between the multiplexer and the socket.
const CHUNK_BUFFER: usize = 64;

/// Policy violation, used when the session table is full.
const CLOSE_POLICY: u16 = 1008;
/// Going away, used on server shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;

enum Outbound {
    Text(String),
    Close(u16, String),
}

/// Everything a connection needs, shared across connections.
#[derive(Clone)]
pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) sessions: Arc<SessionManager>,
    supervisor: ProcessSupervisor,
    hooks: Arc<HookRunner>,
    post_processor: Arc<dyn OutputPostProcessor>,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionManager>,
        hooks: HookRunner,
        post_processor: Arc<dyn OutputPostProcessor>,
        sink: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config.supervisor_config()),
            config,
            sessions,
            hooks: Arc::new(hooks),
            post_processor,
            sink,
            shutdown,
        }
    }

    /// Serve one upgraded socket until the client leaves or the server stops.
    pub async fn handle_socket(self, socket: WebSocket) {
        let (mut ws_sink, mut ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

        // Task: forward queued frames to the socket
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let msg = match frame {
                    Outbound::Text(text) => Message::Text(text.into()),
                    Outbound::Close(code, reason) => {
                        let _ = ws_sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                };
                if ws_sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let session_id = match self.sessions.create_session().await {
            Ok(id) => id,
            Err(e) => {
                send_json(&tx, &RpcResponse::error(Value::Null, RpcError::from(&e))).await;
                let _ = tx
                    .send(Outbound::Close(CLOSE_POLICY, "session limit reached".into()))
                    .await;
                drop(tx);
                let _ = writer.await;
                return;
            }
        };

        let conn = Connection {
            engine: self.clone(),
            session_id: session_id.clone(),
            tx: tx.clone(),
        };
        conn.notify(
            method::CONNECTED,
            ConnectedParams {
                session_id: session_id.clone(),
                version: PROTOCOL_VERSION,
                capabilities: CAPABILITIES,
            },
        )
        .await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = tx.send(Outbound::Close(CLOSE_GOING_AWAY, "server shutting down".into())).await;
                    break;
                }
                msg = ws_stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => conn.dispatch(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        let err = ExecError::ProtocolError("binary frames are not supported".into());
                        conn.respond_error(Value::Null, &err).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "WebSocket read failed");
                        break;
                    }
                },
            }
        }

        self.sessions.close_session(&session_id).await;
        tracing::info!(session_id = %session_id, "Connection closed");
    }
}

/// Per-connection dispatcher.
struct Connection {
    engine: Engine,
    session_id: SessionId,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    async fn dispatch(&self, text: &str) {
        let request = match RpcRequest::parse(text) {
            Ok(r) => r,
            Err((id, err)) => {
                send_json(&self.tx, &RpcResponse::error(id, err)).await;
                return;
            }
        };
        let id = request.id.clone();

        // an evicted session answers everything with NotFound
        if let Err(e) = self.engine.sessions.touch(&self.session_id).await {
            self.respond_error(id, &e).await;
            return;
        }

        let outcome = match request.method.as_str() {
            "execute" => self.execute(&request).await,
            "cancel" => self.cancel().await,
            "control" => self.control(&request).await,
            "status" => self.status().await,
            other => {
                let err = RpcError::new(codes::METHOD_NOT_FOUND, format!("method not found: {other}"));
                send_json(&self.tx, &RpcResponse::error(id, err)).await;
                return;
            }
        };

        match outcome {
            Ok(Some(result)) => send_json(&self.tx, &RpcResponse::result(id, result)).await,
            Ok(None) => {}
            Err(e) => self.respond_error(id, &e).await,
        }
    }

    /// Validate, take the session lease, then hand off to an execution task.
    /// The terminal response is sent by that task.
    async fn execute(&self, request: &RpcRequest) -> Result<Option<Value>, ExecError> {
        let params: ExecuteParams = request.params()?;
        let process = &self.engine.config.process;
        process.check_command(&params.command)?;
        let timeout = process.effective_timeout(params.timeout()?);

        let request_key = request_key(&request.id);
        let lease = self
            .engine
            .sessions
            .begin_execution(&self.session_id, &request_key)
            .await?;

        let execution = Execution {
            engine: self.engine.clone(),
            session_id: self.session_id.clone(),
            id: request.id.clone(),
            request_key,
            lease,
            params,
            timeout,
            tx: self.tx.clone(),
        };
        tokio::spawn(execution.run());
        Ok(None)
    }

    async fn cancel(&self) -> Result<Option<Value>, ExecError> {
        let request_id = self.engine.sessions.cancel_execution(&self.session_id).await?;
        to_value(CancelResult {
            status: "cancelling",
            request_id,
        })
    }

    async fn control(&self, request: &RpcRequest) -> Result<Option<Value>, ExecError> {
        let params: ControlParams = request.params()?;
        let (status, notification) = match params.action {
            ControlAction::Cancel => return self.cancel().await,
            ControlAction::Pause => ("paused", method::PROCESS_PAUSED),
            ControlAction::Resume => ("resumed", method::PROCESS_RESUMED),
        };

        let (request_id, control) = self.engine.sessions.active_process(&self.session_id).await?;
        if params.action == ControlAction::Pause {
            control.pause()?;
        } else {
            control.resume()?;
        }
        tracing::info!(session_id = %self.session_id, request_id = %request_id, pid = control.pid(), status, "Process control");

        self.notify(
            notification,
            ProcessSignalParams {
                session_id: self.session_id.clone(),
                request_id: request_id.clone(),
                pid: control.pid(),
            },
        )
        .await;
        Ok(Some(json!({ "status": status, "request_id": request_id })))
    }

    async fn status(&self) -> Result<Option<Value>, ExecError> {
        let snapshot = self.engine.sessions.snapshot(&self.session_id).await?;
        to_value(snapshot)
    }

    async fn notify<P: Serialize>(&self, method: &'static str, params: P) {
        send_json(&self.tx, &Notification::new(method, params)).await;
    }

    async fn respond_error(&self, id: Value, err: &ExecError) {
        send_json(&self.tx, &RpcResponse::error(id, RpcError::from(err))).await;
    }
}

/// A request that failed before or while spawning, with any hooks that ran.
struct Rejected {
    error: ExecError,
    pre_hooks: Vec<HookOutcome>,
}

impl From<ExecError> for Rejected {
    fn from(error: ExecError) -> Self {
        Self {
            error,
            pre_hooks: Vec::new(),
        }
    }
}

/// One accepted `execute` request, holding the session lease until it ends.
struct Execution {
    engine: Engine,
    session_id: SessionId,
    id: Value,
    request_key: String,
    lease: LeaseToken,
    params: ExecuteParams,
    timeout: Duration,
    tx: mpsc::Sender<Outbound>,
}

impl Execution {
    async fn run(self) {
        let started = Instant::now();
        let outcome = self.drive().await;

        // release the session before the client can observe the result
        self.engine
            .sessions
            .end_execution(&self.session_id, self.lease)
            .await;

        let event = match outcome {
            Ok(result) => {
                let event = self.event(result.status.as_str().to_string(), &result, started);
                match serde_json::to_value(&result) {
                    Ok(value) => send_json(&self.tx, &RpcResponse::result(self.id.clone(), value)).await,
                    Err(e) => {
                        let err = ExecError::Internal(format!("failed to encode result: {e}"));
                        send_json(&self.tx, &RpcResponse::error(self.id.clone(), RpcError::from(&err))).await;
                    }
                }
                event
            }
            Err(rejected) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    request_id = %self.request_key,
                    kind = rejected.error.kind(),
                    error = %rejected.error,
                    "Execution rejected"
                );
                let mut err = RpcError::from(&rejected.error);
                if !rejected.pre_hooks.is_empty() {
                    err = err.with_data("hooks", json!(rejected.pre_hooks));
                }
                send_json(&self.tx, &RpcResponse::error(self.id.clone(), err)).await;
                self.rejection_event(&rejected, started)
            }
        };

        let sink = Arc::clone(&self.engine.sink);
        tokio::spawn(async move { sink.record(event).await });
    }

    async fn drive(&self) -> Result<ExecuteResult, Rejected> {
        let mut ctx = HookContext {
            session_id: self.session_id.to_string(),
            request_id: self.request_key.clone(),
            command: self.params.command.clone(),
            description: self.params.description.clone(),
            cwd: self.workdir().map(|p| p.display().to_string()),
            ..HookContext::default()
        };

        let pre_hooks = self.engine.hooks.run_phase(HookPhase::Pre, &ctx).await;
        if let Some(failed) = pre_hooks.iter().find(|o| !o.success) {
            let error = ExecError::HookFailed {
                hook: failed.name.clone(),
                reason: failed.error.clone().unwrap_or_else(|| "failed".into()),
            };
            return Err(Rejected { error, pre_hooks });
        }

        if self
            .engine
            .sessions
            .is_cancel_requested(&self.session_id, self.lease)
            .await
        {
            tracing::info!(session_id = %self.session_id, request_id = %self.request_key, "Cancelled before spawn");
            return Ok(self.cancelled_before_spawn(pre_hooks));
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel(CHUNK_BUFFER);
        let handle = self
            .engine
            .supervisor
            .spawn(self.exec_request(), chunk_tx)
            .map_err(|error| Rejected {
                error,
                pre_hooks: pre_hooks.clone(),
            })?;

        let control = handle.control.clone();
        if let Err(e) = self
            .engine
            .sessions
            .attach_process(&self.session_id, self.lease, control.clone())
            .await
        {
            tracing::info!(session_id = %self.session_id, pid = control.pid(), reason = %e, "Session cancelled during spawn");
            control.cancel();
        }

        send_json(
            &self.tx,
            &Notification::new(
                method::PROCESS_STARTED,
                StartedParams {
                    session_id: self.session_id.clone(),
                    request_id: self.id.clone(),
                    pid: control.pid(),
                    pgid: control.pgid(),
                },
            ),
        )
        .await;

        // Relay until the multiplexer drops its senders: end of both streams,
        // or capture stopped by the supervisor.
        while let Some(chunk) = chunk_rx.recv().await {
            let params = OutputParams::from_chunk(self.session_id.clone(), self.id.clone(), chunk);
            send_json(&self.tx, &Notification::new(method::PROCESS_OUTPUT, params)).await;
        }

        let result = handle.wait().await.map_err(|error| Rejected {
            error,
            pre_hooks: pre_hooks.clone(),
        })?;

        ctx.status = Some(result.status.as_str().to_string());
        ctx.exit_code = result.exit_code;
        ctx.duration_ms = Some(result.duration.as_millis() as u64);
        let post_hooks = self.engine.hooks.run_phase(HookPhase::Post, &ctx).await;

        Ok(self.build_result(result, pre_hooks, post_hooks))
    }

    fn workdir(&self) -> Option<&std::path::Path> {
        self.params
            .cwd
            .as_deref()
            .or(self.engine.config.process.working_dir.as_deref())
    }

    fn exec_request(&self) -> ExecRequest {
        let mut req = ExecRequest::new(self.params.command.clone(), self.timeout);
        req.workdir = self.workdir().map(|p| p.to_path_buf());
        req.env = self.params.env.clone();
        req.input = self.params.input.clone();
        if self.params.json_mode {
            req.retain_stdout = self.engine.config.process.max_capture_bytes;
        }
        req
    }

    fn build_result(
        &self,
        result: CompletionResult,
        pre: Vec<HookOutcome>,
        post: Vec<HookOutcome>,
    ) -> ExecuteResult {
        let (parsed, output) = if self.params.json_mode {
            let raw = String::from_utf8_lossy(&result.capture.stdout.retained);
            let structured = self.engine.post_processor.process(&raw);
            (Some(structured.parsed), Some(structured.value))
        } else {
            (None, None)
        };

        let capture_error = result
            .capture
            .stdout
            .error
            .clone()
            .or_else(|| result.capture.stderr.error.clone());

        ExecuteResult {
            session_id: self.session_id.clone(),
            status: result.status,
            state: result.state,
            exit_code: result.exit_code,
            signal: result.signal,
            pid: Some(result.pid),
            duration_ms: result.duration.as_millis() as u64,
            timeout_secs: result.timeout.as_secs_f64(),
            stdout_bytes: result.capture.stdout.bytes,
            stderr_bytes: result.capture.stderr.bytes,
            stdout_chunks: result.capture.stdout.chunks,
            stderr_chunks: result.capture.stderr.chunks,
            capture_complete: result.capture.is_complete(),
            error: result.error.or(capture_error),
            hooks: HookReport { pre, post },
            parsed,
            output,
        }
    }

    fn cancelled_before_spawn(&self, pre: Vec<HookOutcome>) -> ExecuteResult {
        ExecuteResult {
            session_id: self.session_id.clone(),
            status: CompletionStatus::Cancelled,
            state: ProcessState::Cancelled,
            exit_code: None,
            signal: None,
            pid: None,
            duration_ms: 0,
            timeout_secs: self.timeout.as_secs_f64(),
            stdout_bytes: 0,
            stderr_bytes: 0,
            stdout_chunks: 0,
            stderr_chunks: 0,
            capture_complete: true,
            error: None,
            hooks: HookReport {
                pre,
                post: Vec::new(),
            },
            parsed: None,
            output: None,
        }
    }

    fn event(&self, status: String, result: &ExecuteResult, started: Instant) -> CompletionEvent {
        let mut hooks = result.hooks.pre.clone();
        hooks.extend(result.hooks.post.iter().cloned());
        CompletionEvent {
            session_id: self.session_id.to_string(),
            request_id: self.request_key.clone(),
            command: self.params.command.clone(),
            status,
            exit_code: result.exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            stdout_bytes: result.stdout_bytes,
            stderr_bytes: result.stderr_bytes,
            hooks,
            json_parsed: result.parsed,
            finished_at: chrono::Utc::now(),
        }
    }

    fn rejection_event(&self, rejected: &Rejected, started: Instant) -> CompletionEvent {
        CompletionEvent {
            session_id: self.session_id.to_string(),
            request_id: self.request_key.clone(),
            command: self.params.command.clone(),
            status: rejected.error.kind().to_string(),
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
            stdout_bytes: 0,
            stderr_bytes: 0,
            hooks: rejected.pre_hooks.clone(),
            json_parsed: None,
            finished_at: chrono::Utc::now(),
        }
    }
}

/// Session-table key for a JSON-RPC id.
fn request_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Option<Value>, ExecError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| ExecError::Internal(e.to_string()))
}

async fn send_json<T: Serialize>(tx: &mpsc::Sender<Outbound>, msg: &T) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            // a closed writer means the client is gone; the session is closing
            let _ = tx.send(Outbound::Text(text)).await;
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize outbound message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keys_are_stable_strings() {
        assert_eq!(request_key(&json!("abc")), "abc");
        assert_eq!(request_key(&json!(42)), "42");
        assert_eq!(request_key(&Value::Null), "null");
    }
}
