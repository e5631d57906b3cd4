// ABOUTME: Process supervisor - spawns shell commands in their own process group
// ABOUTME: Enforces timeouts, handles cancel/pause/resume, reports one terminal result

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::pgroup::{self, GroupSignal};
use crate::stream::{
    CaptureSummary, OutputChunk, StreamMultiplexer, CAPTURE_ABANDONED, DEFAULT_CHUNK_SIZE,
};

/// Settings shared by every process the supervisor starts.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub shell: String,
    pub chunk_size: usize,
    /// Time between SIGTERM and SIGKILL, also the post-exit drain window.
    pub grace: Duration,
    /// Export PYTHONUNBUFFERED/NODE_NO_READLINE so interpreters flush promptly.
    pub unbuffered: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            grace: Duration::from_secs(2),
            unbuffered: true,
        }
    }
}

/// One command to run.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub workdir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// Written to stdin, which is then closed. `None` means stdin is /dev/null.
    pub input: Option<String>,
    /// Leading stdout bytes to keep for post-processing.
    pub retain_stdout: usize,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: HashMap::new(),
            timeout,
            input: None,
            retain_stdout: 0,
        }
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn retain_stdout(mut self, limit: usize) -> Self {
        self.retain_stdout = limit;
        self
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Paused,
    /// Leader exited, output still being collected.
    Draining,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed
                | ProcessState::TimedOut
                | ProcessState::Cancelled
                | ProcessState::Failed
        )
    }
}

/// How an execution ended, as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    NonZeroExit,
    TimedOut,
    Cancelled,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::NonZeroExit => "non_zero_exit",
            CompletionStatus::TimedOut => "timed_out",
            CompletionStatus::Cancelled => "cancelled",
            CompletionStatus::Failed => "failed",
        }
    }
}

/// Terminal outcome of one process.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub status: CompletionStatus,
    pub state: ProcessState,
    /// Exit code, or 128 + signal when the process was killed.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub timeout: Duration,
    pub capture: CaptureSummary,
    pub pid: u32,
    pub pgid: i32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum ControlMsg {
    Cancel,
    Pause,
    Resume,
}

/// Cloneable remote for a running process.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: u32,
    pgid: i32,
    tx: mpsc::UnboundedSender<ControlMsg>,
    state: watch::Receiver<ProcessState>,
}

impl ProcessControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Request termination. Returns false if the process already finished.
    pub fn cancel(&self) -> bool {
        self.tx.send(ControlMsg::Cancel).is_ok()
    }

    /// SIGSTOP the process group.
    pub fn pause(&self) -> Result<(), ExecError> {
        self.send(ControlMsg::Pause)
    }

    /// SIGCONT the process group.
    pub fn resume(&self) -> Result<(), ExecError> {
        self.send(ControlMsg::Resume)
    }

    /// Wait until the process reaches `target` or a terminal state.
    pub async fn wait_for(&mut self, target: ProcessState) -> ProcessState {
        let result = self
            .state
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s);
        result.unwrap_or(ProcessState::Failed)
    }

    fn send(&self, msg: ControlMsg) -> Result<(), ExecError> {
        self.tx
            .send(msg)
            .map_err(|_| ExecError::NotFound(format!("process {} already finished", self.pid)))
    }
}

/// A started process: its control and its eventual result.
#[derive(Debug)]
pub struct ProcessHandle {
    pub control: ProcessControl,
    completion: oneshot::Receiver<CompletionResult>,
}

impl ProcessHandle {
    /// Wait for the terminal result. Output chunks have all been sent by then.
    pub async fn wait(self) -> Result<CompletionResult, ExecError> {
        self.completion
            .await
            .map_err(|_| ExecError::Internal("supervisor task ended without a result".into()))
    }
}

/// Starts and supervises child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn `req.command` under the configured shell, forwarding output to `chunks`.
    ///
    /// Spawn problems are returned here; everything after a successful spawn is
    /// reported through the handle.
    pub fn spawn(
        &self,
        req: ExecRequest,
        chunks: mpsc::Sender<OutputChunk>,
    ) -> Result<ProcessHandle, ExecError> {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(&req.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if req.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &req.workdir {
            cmd.current_dir(dir);
        }
        if self.config.unbuffered {
            cmd.env("PYTHONUNBUFFERED", "1").env("NODE_NO_READLINE", "1");
        }
        cmd.envs(&req.env);

        let mut child = cmd.spawn().map_err(|e| {
            let mut msg = format!("{}: {e}", self.config.shell);
            if let Some(dir) = &req.workdir {
                msg.push_str(&format!(" (cwd {})", dir.display()));
            }
            ExecError::SpawnFailed(msg)
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ExecError::SpawnFailed("process exited before its pid was read".into()))?;
        // process_group(0) makes the child its own group leader.
        let pgid = pid as i32;

        tracing::info!(
            pid,
            pgid,
            timeout_secs = req.timeout.as_secs_f64(),
            command = %req.command,
            "Process spawned"
        );

        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), req.input) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::warn!(pid, error = %e, "Failed to write stdin");
                    }
                }
                // dropping stdin closes the pipe
            });
        }

        let mux = StreamMultiplexer::new(self.config.chunk_size).retain_stdout(req.retain_stdout);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stop_capture = CancellationToken::new();
        let capture = tokio::spawn({
            let stop = stop_capture.clone();
            async move { mux.run(stdout, stderr, chunks, stop).await }
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let (done_tx, done_rx) = oneshot::channel();

        let run = Supervised {
            child,
            pid,
            pgid,
            timeout: req.timeout,
            grace: self.config.grace,
            started: Instant::now(),
            state: state_tx,
            stop_capture,
        };
        tokio::spawn(async move {
            let result = run.supervise(control_rx, capture).await;
            let _ = done_tx.send(result);
        });

        Ok(ProcessHandle {
            control: ProcessControl {
                pid,
                pgid,
                tx: control_tx,
                state: state_rx,
            },
            completion: done_rx,
        })
    }
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut(std::io::Result<std::process::ExitStatus>),
    Cancelled(std::io::Result<std::process::ExitStatus>),
}

struct Supervised {
    child: Child,
    pid: u32,
    pgid: i32,
    timeout: Duration,
    grace: Duration,
    started: Instant,
    state: watch::Sender<ProcessState>,
    stop_capture: CancellationToken,
}

impl Supervised {
    async fn supervise(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
        capture: JoinHandle<CaptureSummary>,
    ) -> CompletionResult {
        self.state.send_replace(ProcessState::Running);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut stopped = false;

        let ending = loop {
            tokio::select! {
                res = self.child.wait() => break Ending::Exited(res),
                _ = &mut deadline => {
                    tracing::warn!(pid = self.pid, timeout_secs = self.timeout.as_secs_f64(), "Process timed out, terminating group");
                    let res = pgroup::terminate_group(&mut self.child, self.pgid, self.grace, stopped).await;
                    break Ending::TimedOut(res);
                }
                Some(msg) = control_rx.recv() => match msg {
                    ControlMsg::Cancel => {
                        tracing::info!(pid = self.pid, "Cancelling process group");
                        let res = pgroup::terminate_group(&mut self.child, self.pgid, self.grace, stopped).await;
                        break Ending::Cancelled(res);
                    }
                    ControlMsg::Pause if !stopped => {
                        if self.signal(GroupSignal::Stop) {
                            stopped = true;
                            self.state.send_replace(ProcessState::Paused);
                        }
                    }
                    ControlMsg::Resume if stopped => {
                        if self.signal(GroupSignal::Continue) {
                            stopped = false;
                            self.state.send_replace(ProcessState::Running);
                        }
                    }
                    _ => {}
                },
            }
        };
        drop(control_rx);

        self.state.send_replace(ProcessState::Draining);
        let capture = self.drain(capture).await;

        let (status, state, wait) = match ending {
            Ending::Exited(res) => (CompletionStatus::Completed, ProcessState::Completed, res),
            Ending::TimedOut(res) => (CompletionStatus::TimedOut, ProcessState::TimedOut, res),
            Ending::Cancelled(res) => (CompletionStatus::Cancelled, ProcessState::Cancelled, res),
        };

        let mut result = CompletionResult {
            status,
            state,
            exit_code: None,
            signal: None,
            duration: self.started.elapsed(),
            timeout: self.timeout,
            capture,
            pid: self.pid,
            pgid: self.pgid,
            error: None,
        };

        match wait {
            Ok(exit) => {
                use std::os::unix::process::ExitStatusExt;
                result.exit_code = Some(pgroup::exit_code_of(&exit));
                result.signal = exit.signal();
                if result.status == CompletionStatus::Completed && !exit.success() {
                    result.status = CompletionStatus::NonZeroExit;
                }
            }
            Err(e) => {
                tracing::error!(pid = self.pid, error = %e, "Failed to wait on process");
                result.status = CompletionStatus::Failed;
                result.state = ProcessState::Failed;
                result.error = Some(e.to_string());
            }
        }

        tracing::info!(
            pid = self.pid,
            status = ?result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            stdout_bytes = result.capture.stdout.bytes,
            stderr_bytes = result.capture.stderr.bytes,
            "Process finished"
        );
        self.state.send_replace(result.state);
        result
    }

    /// Collect remaining output after the leader exited.
    ///
    /// Descendants that still hold the pipes get the grace interval, then the
    /// group is swept so the pipes reach EOF. A pipe held from outside the
    /// group gets one more interval before capture is stopped, which ends the
    /// chunk stream for the consumer.
    async fn drain(&self, mut capture: JoinHandle<CaptureSummary>) -> CaptureSummary {
        if let Ok(joined) = tokio::time::timeout(self.grace, &mut capture).await {
            pgroup::reap_stragglers(self.pgid);
            return joined_summary(joined);
        }

        pgroup::reap_stragglers(self.pgid);
        match tokio::time::timeout(self.grace, &mut capture).await {
            Ok(joined) => joined_summary(joined),
            Err(_) => {
                tracing::warn!(pid = self.pid, "Output pipes still open after sweep, abandoning capture");
                self.stop_capture.cancel();
                match tokio::time::timeout(self.grace, &mut capture).await {
                    Ok(joined) => joined_summary(joined),
                    Err(_) => {
                        capture.abort();
                        let mut summary = CaptureSummary::default();
                        summary.stdout.error = Some(CAPTURE_ABANDONED.into());
                        summary
                    }
                }
            }
        }
    }

    fn signal(&self, signal: GroupSignal) -> bool {
        match pgroup::signal_group(self.pgid, signal) {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!(pgid = self.pgid, ?signal, error = %e, "Failed to signal process group");
                false
            }
        }
    }
}

fn joined_summary(joined: Result<CaptureSummary, tokio::task::JoinError>) -> CaptureSummary {
    joined.unwrap_or_else(|e| {
        let mut summary = CaptureSummary::default();
        summary.stdout.error = Some(e.to_string());
        summary
    })
}
