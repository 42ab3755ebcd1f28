//! Durable-store contract.
//!
//! The engine persists messages, tool-call records, metadata, todos, and
//! snapshots through this trait at every safe persistence point. Saves must
//! be atomic per agent: a reader never observes a torn write. Concrete
//! backends (file layouts, databases) live outside this crate; the
//! in-memory implementation here backs tests and examples.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{AgentInfo, Message, Snapshot, ToolCallRecord};

pub use memory::MemoryStore;

/// Durable agent state storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()>;

    /// Loads the message log. `NotFound` when the agent has never been saved.
    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>>;

    async fn save_tool_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()>;

    async fn load_tool_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>>;

    async fn save_info(&self, agent_id: &str, info: &AgentInfo) -> Result<()>;

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>>;

    async fn save_todos(&self, agent_id: &str, todos: &Value) -> Result<()>;

    async fn load_todos(&self, agent_id: &str) -> Result<Option<Value>>;

    async fn save_snapshot(&self, agent_id: &str, snapshot: &Snapshot) -> Result<()>;

    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>>;

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>>;

    /// Erases everything stored for the agent.
    async fn delete_agent(&self, agent_id: &str) -> Result<()>;

    async fn list_agents(&self) -> Result<Vec<String>>;
}
