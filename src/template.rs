//! Agent templates: the system prompt and default toolset an agent is
//! instantiated from.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which tools a template grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateTools {
    /// `"*"`: every tool registered at agent creation.
    All(AllMarker),
    Names(Vec<String>),
}

/// Serde helper so `"*"` round-trips as the all-tools marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllMarker {
    #[serde(rename = "*")]
    All,
}

impl TemplateTools {
    pub fn all() -> Self {
        TemplateTools::All(AllMarker::All)
    }

    pub fn names(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        TemplateTools::Names(names.into_iter().map(Into::into).collect())
    }
}

impl Default for TemplateTools {
    fn default() -> Self {
        TemplateTools::Names(Vec::new())
    }
}

/// A reusable agent definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub id: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: TemplateTools,
}

impl AgentTemplate {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        AgentTemplate {
            id: id.into(),
            system_prompt: system_prompt.into(),
            model: None,
            tools: TemplateTools::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: TemplateTools) -> Self {
        self.tools = tools;
        self
    }
}

/// Registry of templates, keyed by id.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, AgentTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a template.
    pub fn register(&self, template: AgentTemplate) {
        self.templates
            .write()
            .expect("template registry lock poisoned")
            .insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Result<AgentTemplate> {
        self.templates
            .read()
            .expect("template registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("template: {id}")))
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .templates
            .read()
            .expect("template registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get() {
        let registry = TemplateRegistry::new();
        registry.register(
            AgentTemplate::new("assistant", "You are a helpful assistant")
                .with_tools(TemplateTools::names(["fs_read"])),
        );

        let template = registry.get("assistant").unwrap();
        assert_eq!(template.system_prompt, "You are a helpful assistant");
        assert_eq!(registry.get("missing").unwrap_err().kind(), "not_found");
    }

    #[test]
    fn star_tools_roundtrip() {
        let template =
            AgentTemplate::new("t", "prompt").with_tools(TemplateTools::all());
        let raw = serde_json::to_string(&template).unwrap();
        assert!(raw.contains(r#""tools":"*""#));
        let back: AgentTemplate = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.tools, TemplateTools::all());

        let named = AgentTemplate::new("t2", "prompt")
            .with_tools(TemplateTools::names(["fs_read", "bash_run"]));
        let raw = serde_json::to_string(&named).unwrap();
        let back: AgentTemplate = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.tools, TemplateTools::names(["fs_read", "bash_run"]));
    }
}
