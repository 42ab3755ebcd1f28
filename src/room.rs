//! Multi-agent room: named members over a pool with @mention routing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;

/// One member binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub name: String,
    pub agent_id: String,
}

/// One history entry. An empty `to` list means broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub from: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    pub text: String,
    /// Unix milliseconds.
    pub sent: i64,
}

struct RoomState {
    members: HashMap<String, String>,
    history: Vec<RoomMessage>,
}

/// Message routing over a shared pool.
///
/// The room owns only the name → agent-id mapping; agent existence is the
/// pool's business.
pub struct Room {
    pool: Arc<Pool>,
    state: Mutex<RoomState>,
    mention_regex: Regex,
}

impl Room {
    pub fn new(pool: Arc<Pool>) -> Self {
        Room {
            pool,
            state: Mutex::new(RoomState {
                members: HashMap::new(),
                history: Vec::new(),
            }),
            mention_regex: Regex::new(r"@(\w+)").expect("mention regex is valid"),
        }
    }

    /// Binds a display name to an existing pool member.
    pub async fn join(&self, name: impl Into<String>, agent_id: impl Into<String>) -> Result<()> {
        let name = name.into();
        let agent_id = agent_id.into();

        if !self.pool.contains(&agent_id).await {
            return Err(Error::NotFound(format!("agent: {agent_id}")));
        }
        let mut state = self.state.lock().await;
        if state.members.contains_key(&name) {
            return Err(Error::Conflict(format!("member already exists: {name}")));
        }
        state.members.insert(name, agent_id);
        Ok(())
    }

    pub async fn leave(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .members
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("member: {name}")))
    }

    /// Routes a message from a member. With `@name` mentions present, only
    /// the mentioned members receive it; otherwise it is broadcast to
    /// every member except the sender. Unknown mentions are ignored, so
    /// delivery to zero recipients is possible.
    pub async fn say(&self, from: &str, text: &str) -> Result<()> {
        let (targets, entry) = {
            let state = self.state.lock().await;
            if !state.members.contains_key(from) {
                return Err(Error::NotFound(format!("sender is not a member: {from}")));
            }

            let mentions = self.extract_mentions(text);
            let mut targets: Vec<(String, String)> = Vec::new();
            if mentions.is_empty() {
                for (name, agent_id) in &state.members {
                    if name != from {
                        targets.push((name.clone(), agent_id.clone()));
                    }
                }
            } else {
                for mention in &mentions {
                    if let Some(agent_id) = state.members.get(mention) {
                        targets.push((mention.clone(), agent_id.clone()));
                    }
                }
            }

            let entry = RoomMessage {
                from: from.to_string(),
                to: mentions,
                text: text.to_string(),
                sent: Utc::now().timestamp_millis(),
            };
            (targets, entry)
        };

        self.state.lock().await.history.push(entry);
        self.deliver(from, text, &targets).await;
        Ok(())
    }

    /// Sends to every member, sender `"system"`.
    pub async fn broadcast(&self, text: &str) -> Result<()> {
        let targets: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .members
                .iter()
                .map(|(name, agent_id)| (name.clone(), agent_id.clone()))
                .collect()
        };

        self.state.lock().await.history.push(RoomMessage {
            from: "system".to_string(),
            to: Vec::new(),
            text: text.to_string(),
            sent: Utc::now().timestamp_millis(),
        });

        for (name, agent_id) in &targets {
            match self.pool.get(agent_id).await {
                Ok(agent) => {
                    if let Err(e) = agent.send(text).await {
                        warn!(member = %name, error = %e, "broadcast delivery failed");
                    }
                }
                Err(_) => debug!(member = %name, "member agent no longer in pool"),
            }
        }
        Ok(())
    }

    /// Explicit direct message between members.
    pub async fn send_to(&self, from: &str, to: &str, text: &str) -> Result<()> {
        let agent_id = {
            let state = self.state.lock().await;
            if from != "system" && !state.members.contains_key(from) {
                return Err(Error::NotFound(format!("sender is not a member: {from}")));
            }
            state
                .members
                .get(to)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("recipient not found: {to}")))?
        };

        self.state.lock().await.history.push(RoomMessage {
            from: from.to_string(),
            to: vec![to.to_string()],
            text: text.to_string(),
            sent: Utc::now().timestamp_millis(),
        });

        let agent = self.pool.get(&agent_id).await?;
        agent.send(format!("[from:{from}] {text}")).await
    }

    async fn deliver(&self, from: &str, text: &str, targets: &[(String, String)]) {
        let formatted = format!("[from:{from}] {text}");
        for (name, agent_id) in targets {
            match self.pool.get(agent_id).await {
                Ok(agent) => {
                    if let Err(e) = agent.send(formatted.clone()).await {
                        warn!(member = %name, error = %e, "delivery failed");
                    }
                }
                Err(_) => debug!(member = %name, "member agent no longer in pool"),
            }
        }
    }

    /// `@name` occurrences, deduplicated, in first-occurrence order.
    fn extract_mentions(&self, text: &str) -> Vec<String> {
        let mut mentions = Vec::new();
        for capture in self.mention_regex.captures_iter(text) {
            let name = capture[1].to_string();
            if !mentions.contains(&name) {
                mentions.push(name);
            }
        }
        mentions
    }

    pub async fn members(&self) -> Vec<RoomMember> {
        let state = self.state.lock().await;
        let mut members: Vec<RoomMember> = state
            .members
            .iter()
            .map(|(name, agent_id)| RoomMember {
                name: name.clone(),
                agent_id: agent_id.clone(),
            })
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn is_member(&self, name: &str) -> bool {
        self.state.lock().await.members.contains_key(name)
    }

    pub async fn agent_id_of(&self, name: &str) -> Option<String> {
        self.state.lock().await.members.get(name).cloned()
    }

    pub async fn history(&self) -> Vec<RoomMessage> {
        self.state.lock().await.history.clone()
    }

    pub async fn clear_history(&self) {
        self.state.lock().await.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_extraction_dedupes_in_order() {
        let room = Room {
            pool: Arc::new(Pool::new(crate::pool::PoolOptions::new(
                crate::testing::scripted_dependencies(),
            ))),
            state: Mutex::new(RoomState {
                members: HashMap::new(),
                history: Vec::new(),
            }),
            mention_regex: Regex::new(r"@(\w+)").unwrap(),
        };

        assert_eq!(
            room.extract_mentions("hi @bob and @alice, again @bob"),
            vec!["bob".to_string(), "alice".to_string()]
        );
        assert!(room.extract_mentions("no mentions here").is_empty());
        assert_eq!(
            room.extract_mentions("email user@example.com"),
            vec!["example".to_string()]
        );
    }
}
