//! Bounded-concurrency tool execution with per-call timeouts.
//!
//! The executor never inspects tool outputs; it records timing and success
//! and passes arbitrary result shapes through.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

use super::{Tool, ToolContext};

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Simultaneous executions across the executor.
    pub max_concurrency: usize,
    /// Timeout applied when a request carries none.
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_concurrency: 3,
            default_timeout: Duration::from_secs(60),
        }
    }
}

/// One execution request.
pub struct ExecuteRequest {
    pub tool: Arc<dyn Tool>,
    pub input: Value,
    pub context: ToolContext,
    pub timeout: Option<Duration>,
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<Error>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl ExecuteResult {
    fn finish(
        started_at: DateTime<Utc>,
        outcome: std::result::Result<Value, Error>,
    ) -> Self {
        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds();
        match outcome {
            Ok(output) => ExecuteResult {
                success: true,
                output: Some(output),
                error: None,
                started_at,
                ended_at,
                duration_ms,
            },
            Err(error) => ExecuteResult {
                success: false,
                output: None,
                error: Some(error),
                started_at,
                ended_at,
                duration_ms,
            },
        }
    }
}

/// Checks the schema's `required` list against the input mapping.
pub fn validate_input(tool: &dyn Tool, input: &Value) -> Result<()> {
    let schema = tool.input_schema();
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for field in required.iter().filter_map(Value::as_str) {
        if input.get(field).is_none() {
            return Err(Error::Input(format!(
                "missing required field '{field}' for tool '{}'",
                tool.name()
            )));
        }
    }
    Ok(())
}

/// Runs tools under a shared semaphore.
pub struct ToolExecutor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
}

impl ToolExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let width = config.max_concurrency.max(1);
        ToolExecutor {
            semaphore: Arc::new(Semaphore::new(width)),
            config,
        }
    }

    /// Executes one tool call. Semaphore acquisition and the execution
    /// itself both abort on the context's cancellation token; timeouts
    /// count from the moment the permit is held.
    pub async fn execute(&self, request: &ExecuteRequest) -> ExecuteResult {
        let started_at = Utc::now();

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit,
            _ = request.context.cancel.cancelled() => {
                return ExecuteResult::finish(
                    started_at,
                    Err(Error::Cancelled(format!(
                        "tool '{}' cancelled while waiting for a slot",
                        request.tool.name()
                    ))),
                );
            }
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                return ExecuteResult::finish(
                    started_at,
                    Err(Error::Internal("executor semaphore closed".into())),
                );
            }
        };

        if let Err(err) = validate_input(request.tool.as_ref(), &request.input) {
            return ExecuteResult::finish(started_at, Err(err));
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let name = request.tool.name().to_string();
        let outcome = tokio::select! {
            result = tokio::time::timeout(
                timeout,
                request.tool.execute(&request.input, &request.context),
            ) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "tool '{name}' timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
            _ = request.context.cancel.cancelled() => {
                Err(Error::Cancelled(format!("tool '{name}' cancelled")))
            }
        };

        ExecuteResult::finish(started_at, outcome)
    }

    /// Executes a batch; results come back in request order.
    pub async fn execute_batch(&self, requests: &[ExecuteRequest]) -> Vec<ExecuteResult> {
        join_all(requests.iter().map(|request| self.execute(request))).await
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        ToolExecutor::new(ExecutorConfig::default())
    }
}
