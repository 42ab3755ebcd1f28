//! Core data model: messages, content blocks, tool-call records, and
//! agent state.
//!
//! Messages are append-only within an agent. Tool-call records carry an
//! append-only audit trail and only move along the legal edge set enforced
//! by [`ToolCallRecord::transition`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    /// A `{ok:false, error}` result block, marked as an error.
    pub fn error_result(tool_use_id: impl Into<String>, error: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: json!({ "ok": false, "error": error.into() }),
            is_error: true,
        }
    }
}

/// A conversation message: a role plus an ordered block sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Message {
            role: Role::Assistant,
            content,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Message {
            role: Role::User,
            content: results,
        }
    }

    /// First text block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Tool-use blocks in model order.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// Position in an agent's event stream, usable for replay.
///
/// Monotone non-decreasing within one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
}

/// Agent runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Ready,
    Working,
    Paused,
}

/// Named position in the step loop, observable and resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Breakpoint {
    Ready,
    PreModel,
    StreamingModel,
    ToolPending,
    AwaitingApproval,
    PreTool,
    ToolExecuting,
    PostTool,
}

/// Tool-call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallState {
    Pending,
    ApprovalRequired,
    Approved,
    Executing,
    Completed,
    Failed,
    Denied,
    Sealed,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallState::Completed
                | ToolCallState::Failed
                | ToolCallState::Denied
                | ToolCallState::Sealed
        )
    }
}

/// Approval outcome attached to a tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallApproval {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One audit-trail entry. Entries are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub state: ToolCallState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// The full audited history of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub state: ToolCallState,
    #[serde(default)]
    pub approval: ToolCallApproval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub audit_trail: Vec<AuditEntry>,
}

impl ToolCallRecord {
    /// Creates a record in PENDING with a "created" audit entry.
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        ToolCallRecord {
            id: id.into(),
            name: name.into(),
            input,
            state: ToolCallState::Pending,
            approval: ToolCallApproval::default(),
            result: None,
            error: None,
            is_error: false,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
            audit_trail: vec![AuditEntry {
                state: ToolCallState::Pending,
                timestamp: now,
                note: "created".to_string(),
            }],
        }
    }

    fn edge_is_legal(from: ToolCallState, to: ToolCallState) -> bool {
        use ToolCallState::*;
        if to == Sealed {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Pending, ApprovalRequired)
                | (Pending, Approved)
                | (Pending, Failed)
                | (Pending, Denied)
                | (ApprovalRequired, Approved)
                | (ApprovalRequired, Denied)
                | (ApprovalRequired, Failed)
                | (Approved, Executing)
                | (Approved, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    /// Moves the record along a legal edge, appending exactly one audit
    /// entry. Illegal edges are internal errors and leave the record
    /// untouched.
    pub fn transition(&mut self, to: ToolCallState, note: impl Into<String>) -> Result<()> {
        if !Self::edge_is_legal(self.state, to) {
            return Err(Error::Internal(format!(
                "illegal tool-call transition {:?} -> {:?} for call {}",
                self.state, to, self.id
            )));
        }
        let now = Utc::now();
        self.state = to;
        self.updated_at = now;
        self.audit_trail.push(AuditEntry {
            state: to,
            timestamp: now,
            note: note.into(),
        });
        Ok(())
    }

    /// Transitions to FAILED and records the error string.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.transition(ToolCallState::Failed, error.clone())?;
        self.error = Some(error);
        self.is_error = true;
        Ok(())
    }

    /// Transitions to DENIED with the policy reason.
    pub fn deny(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.transition(ToolCallState::Denied, reason.clone())?;
        self.error = Some(reason);
        Ok(())
    }

    /// Transitions to COMPLETED and stores the executor output.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(ToolCallState::Completed, "execution succeeded")?;
        self.result = Some(result);
        Ok(())
    }

    /// Seals a non-terminal record during crash recovery.
    pub fn seal(&mut self) -> Result<()> {
        self.transition(ToolCallState::Sealed, "resumed-after-crash")
    }

    /// Records start/end times and the derived duration.
    pub fn set_timing(&mut self, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) {
        self.started_at = Some(started_at);
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - started_at).num_milliseconds());
    }

    /// Lightweight projection for event payloads.
    pub fn snapshot(&self) -> ToolCallSnapshot {
        ToolCallSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            approval: self.approval.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            is_error: self.is_error,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
        }
    }
}

/// Event-payload projection of a [`ToolCallRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSnapshot {
    pub id: String,
    pub name: String,
    pub state: ToolCallState,
    #[serde(default)]
    pub approval: ToolCallApproval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Durable snapshot of an agent at a safe persistence point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub messages: Vec<Message>,
    pub last_sfp_index: usize,
    pub last_bookmark: Option<Bookmark>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Runtime status of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub state: AgentState,
    pub breakpoint: Breakpoint,
    pub step_count: u64,
    pub last_sfp_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bookmark: Option<Bookmark>,
    pub cursor: i64,
}

/// Persisted agent metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub template_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub lineage: Vec<String>,
    pub config_version: String,
    pub message_count: usize,
    #[serde(default)]
    pub last_sfp_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bookmark: Option<Bookmark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<Breakpoint>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Result of a blocking [`chat`](crate::agent::Agent::chat) round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResult {
    pub status: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<Bookmark>,
}
