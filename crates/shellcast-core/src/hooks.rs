// ABOUTME: Hook runner - executes configured pre/post hooks as time-bounded external programs
// ABOUTME: Hooks run sequentially in (phase, order) order; a pre-hook failure stops its phase

use std::collections::HashSet;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::ConfigError;
use crate::pgroup::{self, GroupSignal};

/// Hook timeout when the configuration does not give one.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

const STDERR_EXCERPT: usize = 500;

/// How long hook output may keep arriving after the hook process exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

/// Static description of one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub name: String,
    /// Program and arguments, split shell-style. No shell is involved.
    pub command: String,
    pub phase: HookPhase,
    pub timeout: Duration,
    /// Lower runs first; ties keep declaration order.
    pub order: i32,
}

impl HookDescriptor {
    /// Split the command line, rejecting descriptors that can never run.
    pub fn argv(&self) -> Result<Vec<String>, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidHook {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        let argv = shlex::split(&self.command).ok_or_else(|| invalid("command has unbalanced quotes"))?;
        if argv.is_empty() {
            return Err(invalid("command is empty"));
        }
        Ok(argv)
    }
}

/// What a hook is told about the execution it wraps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookContext {
    pub session_id: String,
    pub request_id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Post phase only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Result of one hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookOutcome {
    pub name: String,
    pub phase: HookPhase,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// JSON the hook printed on stdout, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookOutcome {
    fn failed(hook: &HookDescriptor, started: Instant, error: String) -> Self {
        Self {
            name: hook.name.clone(),
            phase: hook.phase,
            success: false,
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            data: None,
            error: Some(error),
        }
    }
}

struct PreparedHook {
    descriptor: HookDescriptor,
    argv: Vec<String>,
}

/// Validated, ordered hook list.
pub struct HookRunner {
    hooks: Vec<PreparedHook>,
}

impl HookRunner {
    pub fn new(descriptors: Vec<HookDescriptor>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut hooks = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if !seen.insert(descriptor.name.clone()) {
                return Err(ConfigError::DuplicateHook(descriptor.name));
            }
            let argv = descriptor.argv()?;
            hooks.push(PreparedHook { descriptor, argv });
        }
        // stable: equal (phase, order) keep declaration order
        hooks.sort_by_key(|h| (h.descriptor.phase, h.descriptor.order));
        Ok(Self { hooks })
    }

    pub fn empty() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn count(&self, phase: HookPhase) -> usize {
        self.hooks.iter().filter(|h| h.descriptor.phase == phase).count()
    }

    pub fn names(&self, phase: HookPhase) -> Vec<&str> {
        self.phase(phase).map(|h| h.descriptor.name.as_str()).collect()
    }

    fn phase(&self, phase: HookPhase) -> impl Iterator<Item = &PreparedHook> {
        self.hooks.iter().filter(move |h| h.descriptor.phase == phase)
    }

    /// Run every hook of `phase` in order.
    ///
    /// The pre phase stops after the first failure, so the returned list ends
    /// with the failing outcome. The post phase always runs every hook.
    pub async fn run_phase(&self, phase: HookPhase, ctx: &HookContext) -> Vec<HookOutcome> {
        let mut outcomes = Vec::new();
        for hook in self.phase(phase) {
            let outcome = run_hook(hook, ctx).await;
            let stop = phase == HookPhase::Pre && !outcome.success;
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        outcomes
    }
}

async fn run_hook(hook: &PreparedHook, ctx: &HookContext) -> HookOutcome {
    let desc = &hook.descriptor;
    let started = Instant::now();

    let payload = match context_payload(desc, ctx) {
        Ok(p) => p,
        Err(e) => return HookOutcome::failed(desc, started, format!("failed to encode context: {e}")),
    };

    let mut cmd = Command::new(&hook.argv[0]);
    cmd.args(&hook.argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .env("SHELLCAST_HOOK_NAME", &desc.name)
        .env("SHELLCAST_HOOK_PHASE", desc.phase.as_str())
        .env("SHELLCAST_SESSION_ID", &ctx.session_id)
        .env("SHELLCAST_COMMAND", &ctx.command)
        .env("SHELLCAST_HOOK_CONTEXT", &payload);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(hook = %desc.name, error = %e, "Hook failed to start");
            return HookOutcome::failed(desc, started, format!("failed to start {}: {e}", hook.argv[0]));
        }
    };
    let pgid = child.id().map(|pid| pid as i32);

    if let Some(mut stdin) = child.stdin.take() {
        let bytes = payload.into_bytes();
        tokio::spawn(async move {
            // hooks that ignore stdin close it early
            let _ = stdin.write_all(&bytes).await;
        });
    }

    let stdout_task = child.stdout.take().map(|r| tokio::spawn(read_all(r)));
    let stderr_task = child.stderr.take().map(|r| tokio::spawn(read_all(r)));

    // Bounded by the hook's own exit, not by EOF on its pipes.
    let status = match tokio::time::timeout(desc.timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            abort_reader(stdout_task);
            abort_reader(stderr_task);
            return HookOutcome::failed(desc, started, format!("failed to wait: {e}"));
        }
        Err(_) => {
            if let Some(pgid) = pgid {
                let _ = pgroup::signal_group(pgid, GroupSignal::Kill);
            }
            abort_reader(stdout_task);
            abort_reader(stderr_task);
            tracing::warn!(
                hook = %desc.name,
                timeout_secs = desc.timeout.as_secs_f64(),
                "Hook timed out, killed its process group"
            );
            let mut outcome = HookOutcome::failed(
                desc,
                started,
                format!("timed out after {:.1}s", desc.timeout.as_secs_f64()),
            );
            outcome.timed_out = true;
            return outcome;
        }
    };

    if let Some(pgid) = pgid {
        pgroup::reap_stragglers(pgid);
    }
    let stdout_bytes = collect_output(stdout_task, &desc.name).await;
    let stderr_bytes = collect_output(stderr_task, &desc.name).await;

    let exit_code = pgroup::exit_code_of(&status);
    let stdout = String::from_utf8_lossy(&stdout_bytes);
    let data = serde_json::from_str::<Value>(stdout.trim()).ok();

    let reported_failure = data
        .as_ref()
        .and_then(|v| v.get("success"))
        .and_then(Value::as_bool)
        == Some(false);

    let error = if !status.success() {
        Some(format!("exit code {exit_code}{}", stderr_excerpt(&stderr_bytes)))
    } else if reported_failure {
        let reason = data
            .as_ref()
            .and_then(|v| v.get("error").or_else(|| v.get("message")))
            .and_then(Value::as_str)
            .unwrap_or("hook reported success=false");
        Some(reason.to_string())
    } else {
        None
    };

    let outcome = HookOutcome {
        name: desc.name.clone(),
        phase: desc.phase,
        success: error.is_none(),
        exit_code: Some(exit_code),
        duration_ms: started.elapsed().as_millis() as u64,
        timed_out: false,
        data,
        error,
    };

    if outcome.success {
        tracing::info!(hook = %desc.name, phase = desc.phase.as_str(), duration_ms = outcome.duration_ms, "Hook succeeded");
    } else {
        tracing::warn!(
            hook = %desc.name,
            phase = desc.phase.as_str(),
            exit_code,
            error = outcome.error.as_deref().unwrap_or_default(),
            "Hook failed"
        );
    }
    outcome
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    // a read error keeps whatever arrived before it
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

/// Output of a reader task, waiting at most [`OUTPUT_GRACE`] after the hook exited.
///
/// A pipe still held by a process outside the hook's group yields empty output.
async fn collect_output(task: Option<JoinHandle<Vec<u8>>>, hook: &str) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(OUTPUT_GRACE, &mut task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::warn!(hook, error = %e, "Hook output reader failed");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(hook, "Hook output pipe still open after exit, ignoring it");
            task.abort();
            Vec::new()
        }
    }
}

fn abort_reader(task: Option<JoinHandle<Vec<u8>>>) {
    if let Some(task) = task {
        task.abort();
    }
}

fn context_payload(desc: &HookDescriptor, ctx: &HookContext) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(ctx)?;
    if let Value::Object(map) = &mut value {
        map.insert("hook".into(), Value::String(desc.name.clone()));
        map.insert("phase".into(), Value::String(desc.phase.as_str().into()));
    }
    serde_json::to_string(&value)
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let excerpt: String = text.chars().take(STDERR_EXCERPT).collect();
    format!(": {excerpt}")
}
