//! Agent configuration types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sandbox::SandboxKind;

/// Model-provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Sandbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    pub work_dir: String,
    /// Reject file access outside `work_dir` (plus `allow_paths`).
    #[serde(default)]
    pub enforce_boundary: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_paths: Vec<String>,
    /// Files the engine watches, surfacing `file_changed` monitor events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch_files: Vec<String>,
}

impl SandboxConfig {
    pub fn local(work_dir: impl Into<String>) -> Self {
        SandboxConfig {
            kind: SandboxKind::Local,
            work_dir: work_dir.into(),
            enforce_boundary: false,
            allow_paths: Vec::new(),
            watch_files: Vec::new(),
        }
    }

    pub fn mock() -> Self {
        SandboxConfig {
            kind: SandboxKind::Mock,
            work_dir: ".".to_string(),
            enforce_boundary: false,
            allow_paths: Vec::new(),
            watch_files: Vec::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig::local(".")
    }
}

/// Configuration for one agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable id; generated (`agt:<uuid>`) when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    /// Explicit tool list; defaults to the template's tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, Value>,
}

impl AgentConfig {
    pub fn new(template_id: impl Into<String>) -> Self {
        AgentConfig {
            agent_id: None,
            template_id: template_id.into(),
            model: None,
            sandbox: None,
            tools: None,
            extras: HashMap::new(),
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }
}
