// ABOUTME: Core library for shellcast - sessions, supervision, streaming, hooks
// ABOUTME: Shared by the protocol server and anything embedding the execution core

pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod json_mode;
pub mod pgroup;
pub mod session;
pub mod stream;
pub mod supervisor;

pub use config::{Config, HookConfig, ProcessConfig, ServerConfig, SessionsConfig};
pub use error::{ConfigError, ExecError};
pub use events::{ChannelSink, CompletionEvent, EventSink, TracingSink};
pub use hooks::{HookContext, HookDescriptor, HookOutcome, HookPhase, HookRunner};
pub use json_mode::{JsonModeProcessor, OutputPostProcessor, StructuredOutput};
pub use session::{
    LeaseToken, SessionId, SessionLimits, SessionManager, SessionSnapshot, SessionState,
    SessionStats,
};
pub use stream::{CaptureSummary, Origin, OutputChunk, StreamMultiplexer, StreamStats};
pub use supervisor::{
    CompletionResult, CompletionStatus, ExecRequest, ProcessControl, ProcessHandle,
    ProcessState, ProcessSupervisor, SupervisorConfig,
};
