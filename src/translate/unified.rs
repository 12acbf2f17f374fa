//! Protocol-agnostic pivot types used as the internal representation for
//! OpenAI Chat, OpenAI Responses, and Anthropic Messages (spec §4.6).
//!
//! Grounded closely on
//! `other_examples/56eafc9a_grafbase-nexus__crates-llm-src-messages-unified.rs.rs`,
//! trimmed to the three protocols this gateway speaks (the source also
//! covers Google/Bedrock, which are out of scope here).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content, supporting both the simple-string shape (OpenAI Chat)
/// and the block-array shape (Anthropic Messages, OpenAI Responses tool
/// flows) without forcing an allocation for the common text-only case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedContent {
    Text(String),
    Blocks(Vec<UnifiedBlock>),
}

impl UnifiedContent {
    pub fn as_text(&self) -> String {
        match self {
            UnifiedContent::Text(t) => t.clone(),
            UnifiedContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    UnifiedBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UnifiedBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON-string arguments (OpenAI shape); callers needing a parsed
    /// value call `serde_json::from_str` themselves, matching how the
    /// teacher's `OpenAIDelta` keeps `content` as a plain string until the
    /// caller needs structure.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub role: UnifiedRole,
    pub content: UnifiedContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<UnifiedToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl UnifiedMessage {
    pub fn text(role: UnifiedRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: UnifiedContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedFinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl std::fmt::Display for UnifiedFinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnifiedFinishReason::Stop => "stop",
            UnifiedFinishReason::Length => "length",
            UnifiedFinishReason::ContentFilter => "content_filter",
            UnifiedFinishReason::ToolCalls => "tool_calls",
        };
        write!(f, "{s}")
    }
}

/// A normalized request, the pivot both translation directions go through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<UnifiedMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
    pub tools: Option<Vec<UnifiedTool>>,
    pub tool_choice: Option<Value>,
}
