//! Test support: a scripted provider that replays canned chunk
//! sequences, plus ready-made dependencies for exercising engines without
//! a real model.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;

use crate::agent::Dependencies;
use crate::config::{AgentConfig, ModelConfig, SandboxConfig};
use crate::error::{Error, Result};
use crate::provider::{
    BlockKind, Provider, ProviderFactory, ProviderStream, StreamChunk, StreamOptions, TokenUsage,
};
use crate::store::MemoryStore;
use crate::template::{AgentTemplate, TemplateRegistry, TemplateTools};
use crate::types::Message;

/// Replays queued turns; when the queue is empty it answers with a plain
/// `ok` text turn so agents always terminate.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<Result<StreamChunk>>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one completion worth of chunks.
    pub fn push_turn(&self, chunks: Vec<StreamChunk>) {
        self.turns
            .lock()
            .expect("scripted provider lock poisoned")
            .push_back(chunks.into_iter().map(Ok).collect());
    }

    /// Queues a turn that fails mid-stream after an opening text block.
    pub fn push_failing_turn(&self, error: Error) {
        let chunks = vec![
            Ok(StreamChunk::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
                id: None,
                name: None,
            }),
            Ok(StreamChunk::TextDelta {
                index: 0,
                text: "partial".to_string(),
            }),
            Err(error),
        ];
        self.turns
            .lock()
            .expect("scripted provider lock poisoned")
            .push_back(chunks);
    }

    /// Chunks for a plain text completion.
    pub fn text_turn(text: &str) -> Vec<StreamChunk> {
        vec![
            StreamChunk::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
                id: None,
                name: None,
            },
            StreamChunk::TextDelta {
                index: 0,
                text: text.to_string(),
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::MessageDelta {
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
            },
        ]
    }

    /// Chunks for a completion that calls one tool, streaming the input
    /// JSON in two fragments.
    pub fn tool_use_turn(id: &str, name: &str, input_json: &str) -> Vec<StreamChunk> {
        let split = input_json.len() / 2;
        let (head, tail) = input_json.split_at(split);
        vec![
            StreamChunk::ContentBlockStart {
                index: 0,
                kind: BlockKind::ToolUse,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
            },
            StreamChunk::InputJsonDelta {
                index: 0,
                partial_json: head.to_string(),
            },
            StreamChunk::InputJsonDelta {
                index: 0,
                partial_json: tail.to_string(),
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::MessageDelta {
                usage: Some(TokenUsage {
                    input_tokens: 20,
                    output_tokens: 25,
                }),
            },
        ]
    }

    /// Chunks for a thinking block followed by text.
    pub fn thinking_then_text_turn(thinking: &str, text: &str) -> Vec<StreamChunk> {
        vec![
            StreamChunk::ContentBlockStart {
                index: 0,
                kind: BlockKind::Thinking,
                id: None,
                name: None,
            },
            StreamChunk::ThinkingDelta {
                index: 0,
                thinking: thinking.to_string(),
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::ContentBlockStart {
                index: 1,
                kind: BlockKind::Text,
                id: None,
                name: None,
            },
            StreamChunk::TextDelta {
                index: 1,
                text: text.to_string(),
            },
            StreamChunk::ContentBlockStop { index: 1 },
            StreamChunk::MessageDelta { usage: None },
        ]
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream(&self, _messages: &[Message], _opts: StreamOptions) -> Result<ProviderStream> {
        let turn = self
            .turns
            .lock()
            .expect("scripted provider lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Self::text_turn("ok").into_iter().map(Ok).collect());
        Ok(stream::iter(turn).boxed())
    }
}

/// Factory handing every agent the same scripted provider.
pub struct ScriptedProviderFactory {
    provider: Arc<ScriptedProvider>,
}

impl ScriptedProviderFactory {
    pub fn new(provider: Arc<ScriptedProvider>) -> Self {
        ScriptedProviderFactory { provider }
    }
}

impl ProviderFactory for ScriptedProviderFactory {
    fn create(&self, _config: &ModelConfig) -> Result<Arc<dyn Provider>> {
        Ok(self.provider.clone())
    }
}

/// Dependencies wired to a fresh scripted provider, an in-memory store,
/// and a `default` template granting every builtin tool.
pub fn scripted_dependencies() -> Dependencies {
    scripted_dependencies_with(Arc::new(ScriptedProvider::new()))
}

/// Like [`scripted_dependencies`], sharing the given provider.
pub fn scripted_dependencies_with(provider: Arc<ScriptedProvider>) -> Dependencies {
    let templates = TemplateRegistry::new();
    templates.register(
        AgentTemplate::new("default", "You are a test assistant")
            .with_model("claude-sonnet-4-5")
            .with_tools(TemplateTools::all()),
    );
    Dependencies::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedProviderFactory::new(provider)),
    )
    .with_template_registry(Arc::new(templates))
}

/// Agent config against the `default` template and the mock sandbox.
pub fn test_agent_config() -> AgentConfig {
    AgentConfig::new("default").with_sandbox(SandboxConfig::mock())
}
