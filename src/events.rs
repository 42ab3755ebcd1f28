//! Event types published by an agent.
//!
//! Every event belongs to exactly one of three channels: `progress`
//! (user-visible streaming), `control` (decisions demanded from outside),
//! and `monitor` (state, metrics, diagnostics). The bus wraps each event
//! in an [`EventEnvelope`] carrying the per-agent cursor and a bookmark.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::types::{AgentState, Bookmark, Breakpoint, ToolCallSnapshot};

/// Event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Progress => write!(f, "progress"),
            Channel::Control => write!(f, "control"),
            Channel::Monitor => write!(f, "monitor"),
        }
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Completed,
    Interrupted,
}

/// Severity of a monitor error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Which part of the runtime an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    Model,
    Tool,
    System,
    Lifecycle,
}

/// How an agent was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    Crash,
    Manual,
}

/// Context-compression phase marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPhase {
    Start,
    End,
}

/// Approval outcome delivered through a [`ReplyHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalDecision::Allow => write!(f, "allow"),
            ApprovalDecision::Deny => write!(f, "deny"),
        }
    }
}

/// Resolved approval, as received by the waiting engine.
#[derive(Debug, Clone)]
pub struct ApprovalReply {
    pub decision: ApprovalDecision,
    pub note: Option<String>,
    pub decided_by: String,
}

/// One-shot reply handle carried by `permission_required` events.
///
/// The engine owns the receiving side and blocks on it; the handle may be
/// cloned freely but delivers at most one reply. A handle obtained through
/// deserialization is detached and rejects replies.
#[derive(Clone, Default)]
pub struct ReplyHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<ApprovalReply>>>>,
    connected: bool,
}

impl ReplyHandle {
    /// Creates a connected handle plus the receiver the engine waits on.
    pub fn new() -> (Self, oneshot::Receiver<ApprovalReply>) {
        let (tx, rx) = oneshot::channel();
        (
            ReplyHandle {
                tx: Arc::new(Mutex::new(Some(tx))),
                connected: true,
            },
            rx,
        )
    }

    /// Delivers the decision. Fails with `Conflict` if a reply was already
    /// sent and with `Internal` on a detached handle.
    pub fn respond(&self, decision: ApprovalDecision, note: Option<String>) -> Result<()> {
        self.respond_as(decision, note, "control")
    }

    pub(crate) fn respond_as(
        &self,
        decision: ApprovalDecision,
        note: Option<String>,
        decided_by: &str,
    ) -> Result<()> {
        if !self.connected {
            return Err(Error::Internal(
                "reply handle is detached from its agent".into(),
            ));
        }
        let sender = self
            .tx
            .lock()
            .map_err(|_| Error::Internal("reply handle lock poisoned".into()))?
            .take();
        match sender {
            Some(tx) => tx
                .send(ApprovalReply {
                    decision,
                    note,
                    decided_by: decided_by.to_string(),
                })
                .map_err(|_| Error::Internal("approval receiver dropped".into())),
            None => Err(Error::Conflict("approval already decided".into())),
        }
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ReplyHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

/// Event emitted by an agent, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    // --- progress -------------------------------------------------------
    ThinkChunkStart {
        step: u64,
    },
    ThinkChunk {
        step: u64,
        delta: String,
    },
    ThinkChunkEnd {
        step: u64,
    },
    TextChunkStart {
        step: u64,
    },
    TextChunk {
        step: u64,
        delta: String,
    },
    TextChunkEnd {
        step: u64,
        text: String,
    },
    #[serde(rename = "tool:start")]
    ToolStart {
        call: ToolCallSnapshot,
    },
    #[serde(rename = "tool:end")]
    ToolEnd {
        call: ToolCallSnapshot,
    },
    #[serde(rename = "tool:error")]
    ToolError {
        call: ToolCallSnapshot,
        error: String,
    },
    Done {
        step: u64,
        reason: DoneReason,
    },

    // --- control --------------------------------------------------------
    PermissionRequired {
        call: ToolCallSnapshot,
        #[serde(skip)]
        respond: ReplyHandle,
    },
    PermissionDecided {
        call_id: String,
        decision: ApprovalDecision,
        decided_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    // --- monitor --------------------------------------------------------
    StateChanged {
        state: AgentState,
    },
    StepComplete {
        step: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
    Error {
        severity: Severity,
        phase: ErrorPhase,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    TokenUsage {
        input_tokens: i64,
        output_tokens: i64,
        total_tokens: i64,
    },
    ToolExecuted {
        call: ToolCallSnapshot,
    },
    AgentResumed {
        strategy: ResumeStrategy,
        sealed: Vec<ToolCallSnapshot>,
    },
    BreakpointChanged {
        previous: Breakpoint,
        current: Breakpoint,
        timestamp: DateTime<Utc>,
    },
    FileChanged {
        path: String,
        mtime: DateTime<Utc>,
    },
    ReminderSent {
        category: String,
        content: String,
    },
    ContextCompression {
        phase: CompressionPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ratio: Option<f64>,
    },
    SchedulerTriggered {
        task_id: String,
        spec: String,
        kind: String,
        triggered_at: DateTime<Utc>,
    },
    ToolManualUpdated {
        tools: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    /// The channel this event is published on.
    pub fn channel(&self) -> Channel {
        use AgentEvent::*;
        match self {
            ThinkChunkStart { .. }
            | ThinkChunk { .. }
            | ThinkChunkEnd { .. }
            | TextChunkStart { .. }
            | TextChunk { .. }
            | TextChunkEnd { .. }
            | ToolStart { .. }
            | ToolEnd { .. }
            | ToolError { .. }
            | Done { .. } => Channel::Progress,
            PermissionRequired { .. } | PermissionDecided { .. } => Channel::Control,
            StateChanged { .. }
            | StepComplete { .. }
            | Error { .. }
            | TokenUsage { .. }
            | ToolExecuted { .. }
            | AgentResumed { .. }
            | BreakpointChanged { .. }
            | FileChanged { .. }
            | ReminderSent { .. }
            | ContextCompression { .. }
            | SchedulerTriggered { .. }
            | ToolManualUpdated { .. } => Channel::Monitor,
        }
    }

    /// Stable kind string, matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        use AgentEvent::*;
        match self {
            ThinkChunkStart { .. } => "think_chunk_start",
            ThinkChunk { .. } => "think_chunk",
            ThinkChunkEnd { .. } => "think_chunk_end",
            TextChunkStart { .. } => "text_chunk_start",
            TextChunk { .. } => "text_chunk",
            TextChunkEnd { .. } => "text_chunk_end",
            ToolStart { .. } => "tool:start",
            ToolEnd { .. } => "tool:end",
            ToolError { .. } => "tool:error",
            Done { .. } => "done",
            PermissionRequired { .. } => "permission_required",
            PermissionDecided { .. } => "permission_decided",
            StateChanged { .. } => "state_changed",
            StepComplete { .. } => "step_complete",
            Error { .. } => "error",
            TokenUsage { .. } => "token_usage",
            ToolExecuted { .. } => "tool_executed",
            AgentResumed { .. } => "agent_resumed",
            BreakpointChanged { .. } => "breakpoint_changed",
            FileChanged { .. } => "file_changed",
            ReminderSent { .. } => "reminder_sent",
            ContextCompression { .. } => "context_compression",
            SchedulerTriggered { .. } => "scheduler_triggered",
            ToolManualUpdated { .. } => "tool_manual_updated",
        }
    }
}

/// An event stamped with its position in the agent's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub cursor: i64,
    pub bookmark: Bookmark,
    pub channel: Channel,
    #[serde(flatten)]
    pub event: AgentEvent,
}
