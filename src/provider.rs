//! Streaming model-provider contract.
//!
//! The runtime never speaks a provider's HTTP wire format; it consumes an
//! already-parsed chunk stream. Chunks follow the shape of streaming
//! message APIs: content blocks open, accumulate deltas, and close, with a
//! trailing message delta carrying usage.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::Message;

/// Content block kinds announced by `content_block_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    ToolUse,
    Thinking,
}

impl FromStr for BlockKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "text" => Ok(BlockKind::Text),
            "tool_use" => Ok(BlockKind::ToolUse),
            "thinking" => Ok(BlockKind::Thinking),
            other => Err(format!("unknown content block kind: {other}")),
        }
    }
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// One chunk of a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    ContentBlockStart {
        index: usize,
        kind: BlockKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    ThinkingDelta {
        index: usize,
        thinking: String,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
}

/// Tool description handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Options for one streaming completion.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub system: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: None,
            system: None,
        }
    }
}

/// Lazy chunk sequence for one completion.
pub type ProviderStream = BoxStream<'static, Result<StreamChunk>>;

/// A streaming model provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Starts a streaming completion over the full message history.
    async fn stream(&self, messages: &[Message], opts: StreamOptions) -> Result<ProviderStream>;

    /// Releases provider resources. Default: nothing to release.
    fn close(&self) {}
}

/// Creates providers from model configuration.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &ModelConfig) -> Result<Arc<dyn Provider>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_kind_parses_wire_names() {
        assert_eq!("text".parse::<BlockKind>().unwrap(), BlockKind::Text);
        assert_eq!("tool_use".parse::<BlockKind>().unwrap(), BlockKind::ToolUse);
        assert_eq!(
            "thinking".parse::<BlockKind>().unwrap(),
            BlockKind::Thinking
        );
        assert!("image".parse::<BlockKind>().is_err());
    }

    #[test]
    fn chunk_serde_uses_wire_tags() {
        let chunk = StreamChunk::ContentBlockStart {
            index: 0,
            kind: BlockKind::ToolUse,
            id: Some("toolu_1".into()),
            name: Some("fs_write".into()),
        };
        let raw = serde_json::to_value(&chunk).unwrap();
        assert_eq!(raw["type"], "content_block_start");
        assert_eq!(raw["kind"], "tool_use");

        let raw = serde_json::to_value(StreamChunk::MessageDelta {
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        })
        .unwrap();
        assert_eq!(raw["type"], "message_delta");
        assert_eq!(raw["usage"]["input_tokens"], 10);
    }
}
