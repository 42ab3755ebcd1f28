//! In-memory store, used by the test suites and as a reference
//! implementation of the per-agent atomicity contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{AgentInfo, Message, Snapshot, ToolCallRecord};

use super::Store;

#[derive(Default, Clone)]
struct AgentData {
    messages: Option<Vec<Message>>,
    tool_records: Vec<ToolCallRecord>,
    info: Option<AgentInfo>,
    todos: Option<Value>,
    snapshots: Vec<Snapshot>,
}

/// Map-backed [`Store`]. Every operation swaps whole values under one lock,
/// which gives per-agent atomicity for free.
#[derive(Default)]
pub struct MemoryStore {
    agents: Mutex<HashMap<String, AgentData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().messages = Some(messages.to_vec());
        Ok(())
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        let agents = self.agents.lock().await;
        agents
            .get(agent_id)
            .and_then(|data| data.messages.clone())
            .ok_or_else(|| Error::NotFound(format!("agent: {agent_id}")))
    }

    async fn save_tool_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().tool_records = records.to_vec();
        Ok(())
    }

    async fn load_tool_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>> {
        let agents = self.agents.lock().await;
        Ok(agents
            .get(agent_id)
            .map(|data| data.tool_records.clone())
            .unwrap_or_default())
    }

    async fn save_info(&self, agent_id: &str, info: &AgentInfo) -> Result<()> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().info = Some(info.clone());
        Ok(())
    }

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>> {
        let agents = self.agents.lock().await;
        Ok(agents.get(agent_id).and_then(|data| data.info.clone()))
    }

    async fn save_todos(&self, agent_id: &str, todos: &Value) -> Result<()> {
        let mut agents = self.agents.lock().await;
        agents.entry(agent_id.to_string()).or_default().todos = Some(todos.clone());
        Ok(())
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Option<Value>> {
        let agents = self.agents.lock().await;
        Ok(agents.get(agent_id).and_then(|data| data.todos.clone()))
    }

    async fn save_snapshot(&self, agent_id: &str, snapshot: &Snapshot) -> Result<()> {
        let mut agents = self.agents.lock().await;
        let data = agents.entry(agent_id.to_string()).or_default();
        data.snapshots.retain(|s| s.id != snapshot.id);
        data.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let agents = self.agents.lock().await;
        Ok(agents
            .get(agent_id)
            .and_then(|data| data.snapshots.iter().find(|s| s.id == snapshot_id).cloned()))
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>> {
        let agents = self.agents.lock().await;
        Ok(agents
            .get(agent_id)
            .map(|data| data.snapshots.clone())
            .unwrap_or_default())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.lock().await;
        agents.remove(agent_id);
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<String>> {
        let agents = self.agents.lock().await;
        let mut ids: Vec<String> = agents.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_roundtrip_and_missing_agent_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.load_messages("agt:missing").await.unwrap_err().kind(),
            "not_found"
        );

        let messages = vec![Message::user("hello")];
        store.save_messages("agt:1", &messages).await.unwrap();
        assert_eq!(store.load_messages("agt:1").await.unwrap(), messages);
    }

    #[tokio::test]
    async fn save_is_atomic_per_agent() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let a = vec![Message::user("a"); 50];
        let b = vec![Message::user("b"); 80];

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let store_a = store.clone();
            let a = a.clone();
            tasks.spawn(async move { store_a.save_messages("agt:1", &a).await });
            let store_b = store.clone();
            let b = b.clone();
            tasks.spawn(async move { store_b.save_messages("agt:1", &b).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        // Whichever writer won, the value is one of the two full logs.
        let loaded = store.load_messages("agt:1").await.unwrap();
        assert!(loaded == a || loaded == b);
    }

    #[tokio::test]
    async fn delete_erases_everything() {
        let store = MemoryStore::new();
        store
            .save_messages("agt:1", &[Message::user("hi")])
            .await
            .unwrap();
        store
            .save_todos("agt:1", &serde_json::json!(["item"]))
            .await
            .unwrap();

        store.delete_agent("agt:1").await.unwrap();
        assert!(store.load_messages("agt:1").await.is_err());
        assert_eq!(store.load_todos("agt:1").await.unwrap(), None);
        assert!(store.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshots_replace_by_id() {
        let store = MemoryStore::new();
        let mut snapshot = Snapshot {
            id: "snap-1".into(),
            messages: vec![],
            last_sfp_index: 0,
            last_bookmark: None,
            created_at: chrono::Utc::now(),
            metadata: Default::default(),
        };
        store.save_snapshot("agt:1", &snapshot).await.unwrap();
        snapshot.last_sfp_index = 4;
        store.save_snapshot("agt:1", &snapshot).await.unwrap();

        let listed = store.list_snapshots("agt:1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_sfp_index, 4);
        assert!(store
            .load_snapshot("agt:1", "snap-1")
            .await
            .unwrap()
            .is_some());
    }
}
