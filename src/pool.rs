//! Agent pool: a capacity-bounded registry of engines keyed by agent id.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agent::{Agent, Dependencies};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::store::Store;

const DEFAULT_MAX_AGENTS: usize = 50;

/// Pool options.
#[derive(Clone)]
pub struct PoolOptions {
    pub dependencies: Dependencies,
    /// Upper bound on simultaneously registered agents.
    pub max_agents: usize,
}

impl PoolOptions {
    pub fn new(dependencies: Dependencies) -> Self {
        PoolOptions {
            dependencies,
            max_agents: DEFAULT_MAX_AGENTS,
        }
    }

    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }
}

/// Lifecycle manager for many concurrent agent instances.
pub struct Pool {
    agents: RwLock<HashMap<String, Agent>>,
    deps: Dependencies,
    max_agents: usize,
}

impl Pool {
    pub fn new(options: PoolOptions) -> Self {
        let max_agents = if options.max_agents == 0 {
            DEFAULT_MAX_AGENTS
        } else {
            options.max_agents
        };
        Pool {
            agents: RwLock::new(HashMap::new()),
            deps: options.dependencies,
            max_agents,
        }
    }

    /// Creates an agent and registers it. Duplicate ids are conflicts; a
    /// full pool is a capacity error and leaves the pool unchanged.
    pub async fn create(&self, config: AgentConfig) -> Result<Agent> {
        let mut agents = self.agents.write().await;

        if let Some(id) = &config.agent_id {
            if agents.contains_key(id) {
                return Err(Error::Conflict(format!("agent already exists: {id}")));
            }
        }
        if agents.len() >= self.max_agents {
            return Err(Error::Capacity(format!(
                "pool is full (max {} agents)",
                self.max_agents
            )));
        }

        let agent = Agent::create(config, self.deps.clone()).await?;
        let id = agent.id().to_string();
        if agents.contains_key(&id) {
            agent.close().await.ok();
            return Err(Error::Conflict(format!("agent already exists: {id}")));
        }
        info!(agent = %id, "agent registered");
        agents.insert(id, agent.clone());
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> Result<Agent> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent: {agent_id}")))
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    /// Registered ids, filtered by prefix (empty prefix lists all).
    pub async fn list(&self, prefix: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .await
            .keys()
            .filter(|id| prefix.is_empty() || id.starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Re-attaches an agent whose state lives in the store, without
    /// reprocessing messages. Idempotent: an id already in the pool
    /// returns the existing engine.
    pub async fn resume(&self, agent_id: &str, mut config: AgentConfig) -> Result<Agent> {
        let mut agents = self.agents.write().await;

        if let Some(agent) = agents.get(agent_id) {
            return Ok(agent.clone());
        }
        if agents.len() >= self.max_agents {
            return Err(Error::Capacity(format!(
                "pool is full (max {} agents)",
                self.max_agents
            )));
        }
        self.deps
            .store
            .load_messages(agent_id)
            .await
            .map_err(|_| Error::NotFound(format!("agent not found in store: {agent_id}")))?;

        config.agent_id = Some(agent_id.to_string());
        let agent = Agent::create(config, self.deps.clone()).await?;
        agents.insert(agent_id.to_string(), agent.clone());
        info!(agent = %agent_id, "agent resumed");
        Ok(agent)
    }

    /// Closes and unregisters without touching persisted state.
    pub async fn remove(&self, agent_id: &str) -> Result<()> {
        let agent = {
            let mut agents = self.agents.write().await;
            agents
                .remove(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent: {agent_id}")))?
        };
        agent.close().await
    }

    /// Closes, unregisters, and erases the agent from the store.
    pub async fn delete(&self, agent_id: &str) -> Result<()> {
        let agent = self.agents.write().await.remove(agent_id);
        if let Some(agent) = agent {
            agent.close().await?;
        }
        self.deps.store.delete_agent(agent_id).await
    }

    /// Calls `f` for every agent in a snapshot of the registry. The pool
    /// lock is released before any call.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Agent),
    {
        let snapshot: Vec<(String, Agent)> = {
            let agents = self.agents.read().await;
            agents
                .iter()
                .map(|(id, agent)| (id.clone(), agent.clone()))
                .collect()
        };
        for (id, agent) in &snapshot {
            f(id, agent);
        }
    }

    pub async fn size(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Closes every agent and clears the registry.
    pub async fn shutdown(&self) -> Result<()> {
        let agents: Vec<(String, Agent)> = {
            let mut map = self.agents.write().await;
            map.drain().collect()
        };

        let mut last_error = None;
        for (id, agent) in agents {
            if let Err(e) = agent.close().await {
                warn!(agent = %id, error = %e, "close failed during shutdown");
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
