//! The per-agent execution engine.
//!
//! An [`Agent`] drives one streaming model conversation: it persists user
//! messages, runs the step loop (model completion, tool dispatch, safe
//! persistence points), and publishes every observable transition on its
//! event bus. All mutable state lives behind one internal lock; other
//! components read it through the operations here.

mod processor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusOptions, EventBus, SubscribeOptions, Subscription};
use crate::config::{AgentConfig, ModelConfig, SandboxConfig};
use crate::error::{Error, Result};
use crate::events::{AgentEvent, Channel, ResumeStrategy};
use crate::permission::PermissionManager;
use crate::provider::{Provider, ProviderFactory};
use crate::sandbox::{FileChangeListener, Sandbox, SandboxFactory};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::template::{AgentTemplate, TemplateRegistry, TemplateTools};
use crate::tools::{ExecutorConfig, Tool, ToolExecutor, ToolRegistry};
use crate::types::{
    AgentInfo, AgentState, AgentStatus, Bookmark, Breakpoint, CompleteResult, ContentBlock,
    Message, Role, Snapshot, ToolCallRecord, ToolCallSnapshot,
};

/// How often [`Agent::chat`] re-checks the engine state.
const CHAT_POLL_INTERVAL: Duration = Duration::from_millis(25);

const CONFIG_VERSION: &str = "v1";

/// Shared collaborators injected into every agent.
#[derive(Clone)]
pub struct Dependencies {
    pub store: Arc<dyn Store>,
    pub provider_factory: Arc<dyn ProviderFactory>,
    pub sandbox_factory: Arc<SandboxFactory>,
    pub tool_registry: Arc<ToolRegistry>,
    pub template_registry: Arc<TemplateRegistry>,
    pub permissions: Arc<PermissionManager>,
    pub scheduler: Option<Arc<Scheduler>>,
}

impl Dependencies {
    /// Dependencies with default registries, auto-mode permissions, and no
    /// scheduler.
    pub fn new(store: Arc<dyn Store>, provider_factory: Arc<dyn ProviderFactory>) -> Self {
        Dependencies {
            store,
            provider_factory,
            sandbox_factory: Arc::new(SandboxFactory::new()),
            tool_registry: Arc::new(ToolRegistry::builtins()),
            template_registry: Arc::new(TemplateRegistry::new()),
            permissions: Arc::new(PermissionManager::default()),
            scheduler: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<PermissionManager>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_tool_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tool_registry = registry;
        self
    }

    pub fn with_template_registry(mut self, registry: Arc<TemplateRegistry>) -> Self {
        self.template_registry = registry;
        self
    }
}

pub(crate) struct AgentMutable {
    pub(crate) state: AgentState,
    pub(crate) breakpoint: Breakpoint,
    pub(crate) messages: Vec<Message>,
    pub(crate) tool_records: Vec<ToolCallRecord>,
    pub(crate) step_count: u64,
    pub(crate) last_sfp_index: usize,
    pub(crate) last_bookmark: Option<Bookmark>,
}

pub(crate) struct AgentInner {
    pub(crate) id: String,
    pub(crate) template: AgentTemplate,
    pub(crate) deps: Dependencies,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) sandbox: Arc<dyn Sandbox>,
    pub(crate) executor: ToolExecutor,
    pub(crate) tools: HashMap<String, Arc<dyn Tool>>,
    pub(crate) mutable: Mutex<AgentMutable>,
    pub(crate) cancel: CancellationToken,
    pub(crate) created_at: DateTime<Utc>,
}

/// Cloneable handle to one agent engine.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("id", &self.inner.id).finish()
    }
}

impl Agent {
    /// Creates (or re-attaches) an agent. Prior messages and tool records
    /// are loaded from the store; tool records left non-terminal by a
    /// crash are sealed and their missing tool results synthesized.
    pub async fn create(mut config: AgentConfig, deps: Dependencies) -> Result<Agent> {
        let id = config
            .agent_id
            .take()
            .unwrap_or_else(|| format!("agt:{}", Uuid::new_v4()));

        let template = deps.template_registry.get(&config.template_id)?;
        let model_config = resolve_model_config(&config, &template)?;
        let provider = deps.provider_factory.create(&model_config)?;

        let sandbox_config = config.sandbox.clone().unwrap_or_default();
        let sandbox = deps.sandbox_factory.create(&sandbox_config)?;

        let tools = build_toolset(&config, &template, &deps)?;

        let inner = Arc::new(AgentInner {
            id: id.clone(),
            template,
            deps,
            bus: Arc::new(EventBus::new(BusOptions::default())),
            provider,
            sandbox,
            executor: ToolExecutor::new(ExecutorConfig::default()),
            tools,
            mutable: Mutex::new(AgentMutable {
                state: AgentState::Ready,
                breakpoint: Breakpoint::Ready,
                messages: Vec::new(),
                tool_records: Vec::new(),
                step_count: 0,
                last_sfp_index: 0,
                last_bookmark: None,
            }),
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        });

        let agent = Agent { inner };
        agent.initialize().await?;
        agent.start_watches(&sandbox_config);
        Ok(agent)
    }

    async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;

        let messages = match inner.deps.store.load_messages(&inner.id).await {
            Ok(messages) => messages,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let records = inner.deps.store.load_tool_records(&inner.id).await?;

        {
            let mut mutable = self.inner.mutable.lock().expect("agent lock poisoned");
            mutable.last_sfp_index = messages.len();
            mutable.messages = messages;
            mutable.tool_records = records;
        }

        self.seal_interrupted_calls().await?;
        self.save_info().await
    }

    /// Crash recovery: non-terminal tool records become SEALED and any
    /// tool-use block left without a result gets an `interrupted` one, so
    /// the persisted history stays valid for the next model call.
    async fn seal_interrupted_calls(&self) -> Result<()> {
        let inner = &self.inner;
        let (sealed, messages, records) = {
            let mut mutable = inner.mutable.lock().expect("agent lock poisoned");

            let mut sealed: Vec<ToolCallSnapshot> = Vec::new();
            for record in mutable.tool_records.iter_mut() {
                if !record.state.is_terminal() {
                    record.seal()?;
                    sealed.push(record.snapshot());
                }
            }
            if sealed.is_empty() {
                return Ok(());
            }

            let answered: Vec<String> = mutable
                .messages
                .iter()
                .flat_map(|m| m.content.iter())
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect();
            let orphaned: Vec<ContentBlock> = sealed
                .iter()
                .filter(|s| !answered.contains(&s.id))
                .map(|s| ContentBlock::error_result(s.id.clone(), "interrupted"))
                .collect();
            if !orphaned.is_empty() {
                mutable.messages.push(Message::tool_results(orphaned));
                mutable.last_sfp_index = mutable.messages.len();
            }

            (sealed, mutable.messages.clone(), mutable.tool_records.clone())
        };

        inner.deps.store.save_messages(&inner.id, &messages).await?;
        inner
            .deps
            .store
            .save_tool_records(&inner.id, &records)
            .await?;

        warn!(agent = %inner.id, sealed = sealed.len(), "sealed interrupted tool calls");
        self.emit(AgentEvent::AgentResumed {
            strategy: ResumeStrategy::Crash,
            sealed,
        });
        Ok(())
    }

    fn start_watches(&self, sandbox_config: &SandboxConfig) {
        if sandbox_config.watch_files.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        let listener: FileChangeListener = Arc::new(move |event| {
            inner.emit(AgentEvent::FileChanged {
                path: event.path,
                mtime: event.mtime,
            });
        });
        match self
            .inner
            .sandbox
            .watch(&sandbox_config.watch_files, listener)
        {
            Ok(watch_id) => debug!(agent = %self.inner.id, watch_id = %watch_id, "watching files"),
            Err(e) => debug!(agent = %self.inner.id, error = %e, "file watching unavailable"),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Appends a user message, persists it, and schedules the step loop.
    /// Returns as soon as the message is durable.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("agent closed: {}", self.inner.id)));
        }

        let messages = {
            let mut mutable = self.inner.mutable.lock().expect("agent lock poisoned");
            mutable.messages.push(Message::user(text));
            mutable.messages.clone()
        };
        self.inner
            .deps
            .store
            .save_messages(&self.inner.id, &messages)
            .await?;

        let claimed = {
            let mut mutable = self.inner.mutable.lock().expect("agent lock poisoned");
            if mutable.state == AgentState::Ready {
                mutable.state = AgentState::Working;
                true
            } else {
                false
            }
        };
        if claimed {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                processor::process(inner).await;
            });
        }
        Ok(())
    }

    /// Send-then-wait: blocks until the engine is READY again and returns
    /// the latest assistant text with the last bookmark.
    pub async fn chat(&self, text: impl Into<String>) -> Result<CompleteResult> {
        self.send(text).await?;

        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("agent closed: {}", self.inner.id)));
            }
            tokio::time::sleep(CHAT_POLL_INTERVAL).await;

            let mutable = self.inner.mutable.lock().expect("agent lock poisoned");
            if mutable.state != AgentState::Ready {
                continue;
            }
            let text = mutable
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .and_then(|m| m.first_text())
                .unwrap_or_default()
                .to_string();
            return Ok(CompleteResult {
                status: "ok".to_string(),
                text,
                last: mutable.last_bookmark,
            });
        }
    }

    /// Subscribes to a subset of the agent's event channels.
    pub fn subscribe(&self, channels: &[Channel], opts: SubscribeOptions) -> Subscription {
        self.inner.bus.subscribe(channels, opts)
    }

    pub fn status(&self) -> AgentStatus {
        let mutable = self.inner.mutable.lock().expect("agent lock poisoned");
        AgentStatus {
            agent_id: self.inner.id.clone(),
            state: mutable.state,
            breakpoint: mutable.breakpoint,
            step_count: mutable.step_count,
            last_sfp_index: mutable.last_sfp_index,
            last_bookmark: mutable.last_bookmark,
            cursor: self.inner.bus.cursor(),
        }
    }

    /// Snapshot of the message log.
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .mutable
            .lock()
            .expect("agent lock poisoned")
            .messages
            .clone()
    }

    /// Snapshot of the tool-call records.
    pub fn tool_records(&self) -> Vec<ToolCallRecord> {
        self.inner
            .mutable
            .lock()
            .expect("agent lock poisoned")
            .tool_records
            .clone()
    }

    /// Persists a durable snapshot of the current state.
    pub async fn save_snapshot(&self, metadata: HashMap<String, Value>) -> Result<Snapshot> {
        let snapshot = {
            let mutable = self.inner.mutable.lock().expect("agent lock poisoned");
            Snapshot {
                id: format!("snap-{}", Uuid::new_v4()),
                messages: mutable.messages.clone(),
                last_sfp_index: mutable.last_sfp_index,
                last_bookmark: mutable.last_bookmark,
                created_at: Utc::now(),
                metadata,
            }
        };
        self.inner
            .deps
            .store
            .save_snapshot(&self.inner.id, &snapshot)
            .await?;
        Ok(snapshot)
    }

    /// Releases resources: cancels in-flight work, ends every
    /// subscription, and disposes the sandbox.
    pub async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.inner.bus.close();
        self.inner.sandbox.dispose().await?;
        self.inner.provider.close();
        Ok(())
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        self.inner.emit(event);
    }

    pub(crate) async fn save_info(&self) -> Result<()> {
        self.inner.save_info().await
    }
}

impl AgentInner {
    /// Publishes an event and advances the agent's last bookmark.
    pub(crate) fn emit(&self, event: AgentEvent) {
        let bookmark = self.bus.emit(event);
        self.mutable
            .lock()
            .expect("agent lock poisoned")
            .last_bookmark = Some(bookmark);
    }

    pub(crate) fn set_breakpoint(&self, breakpoint: Breakpoint) {
        let previous = {
            let mut mutable = self.mutable.lock().expect("agent lock poisoned");
            let previous = mutable.breakpoint;
            mutable.breakpoint = breakpoint;
            previous
        };
        self.emit(AgentEvent::BreakpointChanged {
            previous,
            current: breakpoint,
            timestamp: Utc::now(),
        });
    }

    /// Runs a closure against the stored record for `id` under the engine
    /// lock.
    pub(crate) fn with_record<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ToolCallRecord) -> Result<R>,
    ) -> Result<R> {
        let mut mutable = self.mutable.lock().expect("agent lock poisoned");
        let record = mutable
            .tool_records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::Internal(format!("tool record missing: {id}")))?;
        f(record)
    }

    pub(crate) fn record_snapshot(&self, id: &str) -> Result<ToolCallSnapshot> {
        self.with_record(id, |record| Ok(record.snapshot()))
    }

    pub(crate) fn step_count(&self) -> u64 {
        self.mutable
            .lock()
            .expect("agent lock poisoned")
            .step_count
    }

    pub(crate) async fn save_info(&self) -> Result<()> {
        let info = {
            let mutable = self.mutable.lock().expect("agent lock poisoned");
            AgentInfo {
                agent_id: self.id.clone(),
                template_id: self.template.id.clone(),
                created_at: self.created_at,
                lineage: Vec::new(),
                config_version: CONFIG_VERSION.to_string(),
                message_count: mutable.messages.len(),
                last_sfp_index: mutable.last_sfp_index,
                last_bookmark: mutable.last_bookmark,
                breakpoint: Some(mutable.breakpoint),
                metadata: HashMap::new(),
            }
        };
        self.deps.store.save_info(&self.id, &info).await
    }
}

fn resolve_model_config(config: &AgentConfig, template: &AgentTemplate) -> Result<ModelConfig> {
    if let Some(model) = &config.model {
        return Ok(model.clone());
    }
    if let Some(model) = &template.model {
        return Ok(ModelConfig {
            provider: "anthropic".to_string(),
            model: model.clone(),
            api_key: None,
            base_url: None,
        });
    }
    Err(Error::Input(
        "model config is required (neither agent config nor template carries one)".into(),
    ))
}

fn build_toolset(
    config: &AgentConfig,
    template: &AgentTemplate,
    deps: &Dependencies,
) -> Result<HashMap<String, Arc<dyn Tool>>> {
    let names: Vec<String> = match &config.tools {
        Some(names) => names.clone(),
        None => match &template.tools {
            TemplateTools::All(_) => deps.tool_registry.list(),
            TemplateTools::Names(names) => names.clone(),
        },
    };

    let mut tools = HashMap::new();
    for name in names {
        match deps.tool_registry.create(&name, &json!({})) {
            Ok(tool) => {
                tools.insert(name, tool);
            }
            Err(_) => debug!(tool = %name, "skipping unregistered tool"),
        }
    }
    Ok(tools)
}
