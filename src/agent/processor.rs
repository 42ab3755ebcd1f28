//! The step loop: streaming chunk assembly, tool dispatch, and safe
//! persistence points.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::Error;
use crate::events::{
    AgentEvent, ApprovalDecision, ApprovalReply, DoneReason, ErrorPhase, ReplyHandle, Severity,
};
use crate::permission::PermissionDecision;
use crate::provider::{BlockKind, Provider, StreamChunk, StreamOptions};
use crate::store::Store;
use crate::tools::{schema_of, ExecuteRequest, ToolContext};
use crate::types::{AgentState, Breakpoint, ContentBlock, Message, ToolCallRecord, ToolCallState};

use super::AgentInner;

/// Streaming slot, keyed by content-block index.
enum Slot {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        buffer: String,
    },
    Thinking,
}

enum RoundOutcome {
    /// The completion carried no tool uses; the turn is over.
    Finished,
    /// Tool results were appended; run another model step.
    Continue,
}

enum StepFailure {
    Cancelled,
    Model(Error),
    System(Error),
}

/// Drives one WORKING phase to completion. The caller has already moved
/// the engine to WORKING.
pub(super) async fn process(inner: Arc<AgentInner>) {
    inner.emit(AgentEvent::StateChanged {
        state: AgentState::Working,
    });
    inner.set_breakpoint(Breakpoint::PreModel);

    let mut reason = DoneReason::Completed;
    loop {
        if inner.cancel.is_cancelled() {
            reason = DoneReason::Interrupted;
            break;
        }
        let round_started = Instant::now();
        match run_model_step(&inner, round_started).await {
            Ok(RoundOutcome::Finished) => break,
            Ok(RoundOutcome::Continue) => continue,
            Err(StepFailure::Cancelled) => {
                debug!(agent = %inner.id, "step loop cancelled");
                reason = DoneReason::Interrupted;
                break;
            }
            Err(StepFailure::Model(e)) => {
                inner.emit(AgentEvent::Error {
                    severity: Severity::Error,
                    phase: ErrorPhase::Model,
                    message: e.to_string(),
                    detail: None,
                });
                reason = DoneReason::Interrupted;
                break;
            }
            Err(StepFailure::System(e)) => {
                inner.emit(AgentEvent::Error {
                    severity: Severity::Error,
                    phase: ErrorPhase::System,
                    message: e.to_string(),
                    detail: None,
                });
                reason = DoneReason::Interrupted;
                break;
            }
        }
    }

    let step = inner.step_count();
    inner.emit(AgentEvent::Done { step, reason });
    inner.set_breakpoint(Breakpoint::Ready);
    inner
        .mutable
        .lock()
        .expect("agent lock poisoned")
        .state = AgentState::Ready;
    inner.emit(AgentEvent::StateChanged {
        state: AgentState::Ready,
    });
}

/// One model completion plus, when the model requested tools, one tool
/// round ending at a safe persistence point.
async fn run_model_step(
    inner: &Arc<AgentInner>,
    round_started: Instant,
) -> Result<RoundOutcome, StepFailure> {
    inner.set_breakpoint(Breakpoint::StreamingModel);
    let step = inner.step_count();

    let mut schemas: Vec<_> = inner.tools.values().map(|t| schema_of(t.as_ref())).collect();
    schemas.sort_by(|a, b| a.name.cmp(&b.name));

    let system = if inner.template.system_prompt.is_empty() {
        None
    } else {
        Some(inner.template.system_prompt.clone())
    };
    let opts = StreamOptions {
        tools: schemas,
        system,
        ..Default::default()
    };

    let messages = inner
        .mutable
        .lock()
        .expect("agent lock poisoned")
        .messages
        .clone();

    let mut stream = tokio::select! {
        _ = inner.cancel.cancelled() => return Err(StepFailure::Cancelled),
        stream = inner.provider.stream(&messages, opts) => {
            stream.map_err(StepFailure::Model)?
        }
    };

    // Assemble content blocks from the chunk stream. A failure anywhere
    // here discards the partial message.
    let mut slots: Vec<Option<Slot>> = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(StepFailure::Cancelled),
            chunk = stream.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(StepFailure::Model(e)),
            None => break,
        };

        match chunk {
            StreamChunk::ContentBlockStart {
                index,
                kind,
                id,
                name,
            } => {
                ensure_slot(&mut slots, index);
                match kind {
                    BlockKind::Text => {
                        inner.emit(AgentEvent::TextChunkStart { step });
                        slots[index] = Some(Slot::Text(String::new()));
                    }
                    BlockKind::ToolUse => {
                        slots[index] = Some(Slot::ToolUse {
                            id: id.unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4())),
                            name: name.unwrap_or_default(),
                            buffer: String::new(),
                        });
                    }
                    BlockKind::Thinking => {
                        inner.emit(AgentEvent::ThinkChunkStart { step });
                        slots[index] = Some(Slot::Thinking);
                    }
                }
            }
            StreamChunk::TextDelta { index, text } => {
                if text.is_empty() {
                    continue;
                }
                if let Some(Some(Slot::Text(buffer))) = slots.get_mut(index) {
                    buffer.push_str(&text);
                    inner.emit(AgentEvent::TextChunk { step, delta: text });
                }
            }
            StreamChunk::ThinkingDelta { index, thinking } => {
                if !thinking.is_empty()
                    && matches!(slots.get(index), Some(Some(Slot::Thinking)))
                {
                    inner.emit(AgentEvent::ThinkChunk {
                        step,
                        delta: thinking,
                    });
                }
            }
            StreamChunk::InputJsonDelta {
                index,
                partial_json,
            } => {
                if let Some(Some(Slot::ToolUse { buffer, .. })) = slots.get_mut(index) {
                    buffer.push_str(&partial_json);
                }
            }
            StreamChunk::ContentBlockStop { index } => match slots.get(index) {
                Some(Some(Slot::Text(text))) => {
                    inner.emit(AgentEvent::TextChunkEnd {
                        step,
                        text: text.clone(),
                    });
                }
                Some(Some(Slot::Thinking)) => {
                    inner.emit(AgentEvent::ThinkChunkEnd { step });
                }
                _ => {}
            },
            StreamChunk::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    inner.emit(AgentEvent::TokenUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.input_tokens + usage.output_tokens,
                    });
                }
            }
        }
    }

    // Thinking is streamed but never persisted: the message block set is
    // closed over text, tool_use, and tool_result.
    let mut blocks: Vec<ContentBlock> = Vec::new();
    for slot in slots.into_iter().flatten() {
        match slot {
            Slot::Text(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
            }
            Slot::ToolUse { id, name, buffer } => {
                let input = if buffer.is_empty() {
                    json!({})
                } else {
                    match serde_json::from_str::<Value>(&buffer) {
                        Ok(input) => input,
                        Err(e) => {
                            inner.emit(AgentEvent::Error {
                                severity: Severity::Warn,
                                phase: ErrorPhase::Model,
                                message: format!("invalid tool input JSON for {name}: {e}"),
                                detail: Some(json!({ "partial_json": buffer })),
                            });
                            json!({})
                        }
                    }
                };
                blocks.push(ContentBlock::ToolUse { id, name, input });
            }
            Slot::Thinking => {}
        }
    }

    if blocks.is_empty() {
        return Ok(RoundOutcome::Finished);
    }

    let tool_uses: Vec<(String, String, Value)> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.clone(), name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect();

    let messages = {
        let mut mutable = inner.mutable.lock().expect("agent lock poisoned");
        mutable.messages.push(Message::assistant(blocks));
        mutable.messages.clone()
    };
    inner
        .deps
        .store
        .save_messages(&inner.id, &messages)
        .await
        .map_err(StepFailure::System)?;

    if tool_uses.is_empty() {
        return Ok(RoundOutcome::Finished);
    }

    inner.set_breakpoint(Breakpoint::ToolPending);
    execute_tool_round(inner, round_started, tool_uses).await?;
    Ok(RoundOutcome::Continue)
}

/// Executes every tool-use block in model order, appends the combined
/// tool-result message, and lands the safe persistence point.
async fn execute_tool_round(
    inner: &Arc<AgentInner>,
    round_started: Instant,
    tool_uses: Vec<(String, String, Value)>,
) -> Result<(), StepFailure> {
    let mut results = Vec::with_capacity(tool_uses.len());
    for (id, name, input) in tool_uses {
        let block = execute_single_tool(inner, id, name, input)
            .await
            .map_err(StepFailure::System)?;
        results.push(block);
    }

    let (messages, records, step) = {
        let mut mutable = inner.mutable.lock().expect("agent lock poisoned");
        mutable.messages.push(Message::tool_results(results));
        mutable.step_count += 1;
        mutable.last_sfp_index = mutable.messages.len();
        (
            mutable.messages.clone(),
            mutable.tool_records.clone(),
            mutable.step_count,
        )
    };
    inner
        .deps
        .store
        .save_messages(&inner.id, &messages)
        .await
        .map_err(StepFailure::System)?;
    inner
        .deps
        .store
        .save_tool_records(&inner.id, &records)
        .await
        .map_err(StepFailure::System)?;
    inner.save_info().await.map_err(StepFailure::System)?;

    inner.emit(AgentEvent::StepComplete {
        step,
        duration_ms: Some(round_started.elapsed().as_millis() as i64),
    });
    if let Some(scheduler) = &inner.deps.scheduler {
        scheduler.notify_step(step);
    }
    Ok(())
}

/// Screens, executes, and records a single tool call, returning its
/// result block. Only engine-internal faults surface as errors; tool
/// failures are folded into the block.
async fn execute_single_tool(
    inner: &Arc<AgentInner>,
    id: String,
    name: String,
    input: Value,
) -> Result<ContentBlock, Error> {
    {
        let record = ToolCallRecord::new(id.clone(), name.clone(), input);
        let mut mutable = inner.mutable.lock().expect("agent lock poisoned");
        mutable.tool_records.push(record);
    }
    inner.emit(AgentEvent::ToolStart {
        call: inner.record_snapshot(&id)?,
    });

    let Some(tool) = inner.tools.get(&name).cloned() else {
        let message = format!("tool not found: {name}");
        inner.with_record(&id, |r| r.fail(message.clone()))?;
        inner.emit(AgentEvent::ToolError {
            call: inner.record_snapshot(&id)?,
            error: message.clone(),
        });
        return Ok(ContentBlock::error_result(id, message));
    };

    inner.set_breakpoint(Breakpoint::PreTool);

    let (decision, reason) = inner.deps.permissions.check(&inner.record_snapshot(&id)?);
    match decision {
        PermissionDecision::Deny => {
            inner.with_record(&id, |r| r.deny(reason.clone()))?;
            inner.emit(AgentEvent::ToolError {
                call: inner.record_snapshot(&id)?,
                error: reason.clone(),
            });
            return Ok(ContentBlock::error_result(id, reason));
        }
        PermissionDecision::Ask => {
            if let Some(block) = await_approval(inner, &id, &reason).await? {
                return Ok(block);
            }
        }
        PermissionDecision::Allow => {
            inner.with_record(&id, |r| r.transition(ToolCallState::Approved, reason.clone()))?;
        }
    }

    // Pre-hooks may rewrite the input; a failing hook aborts the call.
    let record = inner.with_record(&id, |r| Ok(r.clone()))?;
    match inner.deps.permissions.run_pre_hooks(record).await {
        Ok(modified) => {
            inner.with_record(&id, |r| {
                r.input = modified.input;
                Ok(())
            })?;
        }
        Err(e) => {
            let message = e.to_string();
            inner.with_record(&id, |r| r.fail(message.clone()))?;
            inner.emit(AgentEvent::ToolError {
                call: inner.record_snapshot(&id)?,
                error: message.clone(),
            });
            return Ok(ContentBlock::error_result(id, message));
        }
    }

    inner.with_record(&id, |r| r.transition(ToolCallState::Executing, "executing"))?;
    inner.set_breakpoint(Breakpoint::ToolExecuting);

    let input = inner.with_record(&id, |r| Ok(r.input.clone()))?;
    let context = ToolContext::new(inner.id.clone(), inner.sandbox.clone())
        .with_cancel(inner.cancel.child_token());
    let exec = inner
        .executor
        .execute(&ExecuteRequest {
            tool,
            input,
            context,
            timeout: None,
        })
        .await;

    inner.with_record(&id, |r| {
        r.set_timing(exec.started_at, exec.ended_at);
        Ok(())
    })?;

    let block = if exec.success {
        let output = exec.output.unwrap_or(Value::Null);
        inner.with_record(&id, |r| r.complete(output.clone()))?;
        ContentBlock::tool_result(id.clone(), output)
    } else {
        let message = exec
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "execution failed".to_string());
        inner.with_record(&id, |r| r.fail(message.clone()))?;
        ContentBlock::error_result(id.clone(), message)
    };

    let snapshot = inner.record_snapshot(&id)?;
    if let Err(e) = inner
        .deps
        .permissions
        .run_post_hooks(&snapshot, snapshot.result.clone(), snapshot.error.clone())
        .await
    {
        warn!(agent = %inner.id, call = %id, error = %e, "post-hook failed");
        inner.emit(AgentEvent::Error {
            severity: Severity::Warn,
            phase: ErrorPhase::Tool,
            message: e.to_string(),
            detail: None,
        });
    }

    inner.set_breakpoint(Breakpoint::PostTool);
    inner.emit(AgentEvent::ToolEnd {
        call: snapshot.clone(),
    });
    inner.emit(AgentEvent::ToolExecuted { call: snapshot });
    Ok(block)
}

/// Suspends the call until the one-shot reply handle is invoked (by a
/// control subscriber or the configured approver) or the agent is closed.
/// Returns the denial block when the call does not proceed.
async fn await_approval(
    inner: &Arc<AgentInner>,
    id: &str,
    reason: &str,
) -> Result<Option<ContentBlock>, Error> {
    inner.with_record(id, |r| {
        r.approval.required = true;
        r.transition(ToolCallState::ApprovalRequired, reason)
    })?;
    inner.set_breakpoint(Breakpoint::AwaitingApproval);

    let (handle, rx) = ReplyHandle::new();
    let snapshot = inner.record_snapshot(id)?;
    inner.emit(AgentEvent::PermissionRequired {
        call: snapshot.clone(),
        respond: handle.clone(),
    });

    if let Some(approver) = inner.deps.permissions.approver() {
        let handle = handle.clone();
        tokio::spawn(async move {
            let (decision, note) = match approver(snapshot).await {
                Ok(outcome) => outcome,
                Err(e) => (PermissionDecision::Deny, format!("approval error: {e}")),
            };
            let mapped = match decision {
                PermissionDecision::Allow => ApprovalDecision::Allow,
                _ => ApprovalDecision::Deny,
            };
            let _ = handle.respond_as(mapped, Some(note), "approver");
        });
    }

    let reply = tokio::select! {
        _ = inner.cancel.cancelled() => {
            let message = "approval wait cancelled";
            inner.with_record(id, |r| r.fail(message))?;
            inner.emit(AgentEvent::ToolError {
                call: inner.record_snapshot(id)?,
                error: message.to_string(),
            });
            return Ok(Some(ContentBlock::error_result(id, message)));
        }
        reply = rx => reply.unwrap_or(ApprovalReply {
            decision: ApprovalDecision::Deny,
            note: Some("approval channel closed".to_string()),
            decided_by: "system".to_string(),
        }),
    };

    inner.emit(AgentEvent::PermissionDecided {
        call_id: id.to_string(),
        decision: reply.decision,
        decided_by: reply.decided_by.clone(),
        note: reply.note.clone(),
    });
    inner.with_record(id, |r| {
        r.approval.decision = Some(reply.decision.to_string());
        r.approval.decided_by = Some(reply.decided_by.clone());
        r.approval.decided_at = Some(Utc::now());
        r.approval.note = reply.note.clone();
        Ok(())
    })?;

    match reply.decision {
        ApprovalDecision::Allow => {
            inner.with_record(id, |r| r.transition(ToolCallState::Approved, "approved"))?;
            Ok(None)
        }
        ApprovalDecision::Deny => {
            let message = reply
                .note
                .unwrap_or_else(|| "denied by approver".to_string());
            inner.with_record(id, |r| r.deny(message.clone()))?;
            inner.emit(AgentEvent::ToolError {
                call: inner.record_snapshot(id)?,
                error: message.clone(),
            });
            Ok(Some(ContentBlock::error_result(id.to_string(), message)))
        }
    }
}

fn ensure_slot(slots: &mut Vec<Option<Slot>>, index: usize) {
    while slots.len() <= index {
        slots.push(None);
    }
}
