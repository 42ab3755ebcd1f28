//! Tool system: the tool contract, execution context, and registry of
//! named constructors.

pub mod bash_run;
pub mod executor;
pub mod fs_read;
pub mod fs_write;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::provider::ToolSchema;
use crate::sandbox::Sandbox;

pub use executor::{ExecuteRequest, ExecuteResult, ExecutorConfig, ToolExecutor};

/// Execution context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    /// Cancelled when the caller aborts or the per-call timeout fires.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>, sandbox: Arc<dyn Sandbox>) -> Self {
        ToolContext {
            agent_id: agent_id.into(),
            sandbox,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One callable capability exposed to the model.
///
/// User-addressable failures (missing file, non-zero exit) come back as
/// `Ok` values shaped `{ok:false, error, recommendations}` so the model can
/// react; `Err` is reserved for inputs that don't match the schema and for
/// infrastructure faults.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema-shaped input description.
    fn input_schema(&self) -> Value;

    /// Usage notes injected into tool manuals. Default: the description.
    fn prompt(&self) -> String {
        self.description().to_string()
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> Result<Value>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Schema projection for the provider request.
pub fn schema_of(tool: &dyn Tool) -> ToolSchema {
    ToolSchema {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema(),
    }
}

/// Constructor for a named tool; receives per-agent tool configuration.
pub type ToolFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Tool>> + Send + Sync>;

/// Registry of tool constructors, keyed by tool name.
#[derive(Default)]
pub struct ToolRegistry {
    factories: RwLock<HashMap<String, ToolFactory>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the builtin tools.
    pub fn builtins() -> Self {
        let registry = Self::new();
        registry.register(
            "fs_read",
            Arc::new(|_| Ok(Arc::new(fs_read::FsReadTool) as Arc<dyn Tool>)),
        );
        registry.register(
            "fs_write",
            Arc::new(|_| Ok(Arc::new(fs_write::FsWriteTool) as Arc<dyn Tool>)),
        );
        registry.register(
            "bash_run",
            Arc::new(|_| Ok(Arc::new(bash_run::BashRunTool) as Arc<dyn Tool>)),
        );
        registry
    }

    pub fn register(&self, name: impl Into<String>, factory: ToolFactory) {
        self.factories
            .write()
            .expect("tool registry lock poisoned")
            .insert(name.into(), factory);
    }

    pub fn create(&self, name: &str, config: &Value) -> Result<Arc<dyn Tool>> {
        let factory = self
            .factories
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tool: {name}")))?;
        factory(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .expect("tool registry lock poisoned")
            .contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .expect("tool registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Names of the builtin filesystem tools.
pub fn filesystem_tools() -> Vec<String> {
    vec!["fs_read".to_string(), "fs_write".to_string()]
}

/// Names of every builtin tool.
pub fn all_builtin_tools() -> Vec<String> {
    let mut names = filesystem_tools();
    names.push("bash_run".to_string());
    names
}
