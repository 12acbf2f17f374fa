//! OpenAI Chat Completions wire types, extending the teacher's
//! `provider/openai.rs` shapes with tool-call fields, plus conversions
//! to/from the unified pivot (spec §4.6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::unified::{UnifiedBlock, UnifiedContent, UnifiedFinishReason, UnifiedMessage, UnifiedRole, UnifiedToolCall};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,
    pub function: ChatFunctionCall,
}

fn default_function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAIStreamChunk {
    pub id: Option<String>,
    pub choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAIChoice {
    pub index: Option<u32>,
    pub delta: Option<OpenAIDelta>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct OpenAIDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAIChatCompletionResponse {
    pub id: Option<String>,
    pub object: Option<String>,
    pub created: Option<i64>,
    pub model: Option<String>,
    pub choices: Vec<OpenAIChatCompletionChoice>,
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAIChatCompletionChoice {
    pub index: Option<u32>,
    pub message: Option<ChatMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAIUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

pub fn finish_reason_from_str(s: &str) -> UnifiedFinishReason {
    match s {
        "tool_calls" => UnifiedFinishReason::ToolCalls,
        "length" => UnifiedFinishReason::Length,
        "content_filter" => UnifiedFinishReason::ContentFilter,
        _ => UnifiedFinishReason::Stop,
    }
}

/// Chat message -> unified message.
pub fn chat_message_to_unified(m: &ChatMessage) -> UnifiedMessage {
    let role = match m.role.as_str() {
        "system" => UnifiedRole::System,
        "assistant" => UnifiedRole::Assistant,
        "tool" => UnifiedRole::Tool,
        _ => UnifiedRole::User,
    };
    let tool_calls = m
        .tool_calls
        .as_ref()
        .map(|calls| {
            calls
                .iter()
                .map(|c| UnifiedToolCall {
                    id: c.id.clone(),
                    name: c.function.name.clone(),
                    arguments: crate::translate::shell::normalize_shell_arguments(
                        &c.function.name,
                        &c.function.arguments,
                    ),
                })
                .collect()
        })
        .unwrap_or_default();
    UnifiedMessage {
        role,
        content: UnifiedContent::Text(m.content.clone().unwrap_or_default()),
        tool_calls,
        tool_call_id: m.tool_call_id.clone(),
    }
}

/// Unified message -> chat message.
pub fn unified_to_chat_message(m: &UnifiedMessage) -> ChatMessage {
    let role = match m.role {
        UnifiedRole::System => "system",
        UnifiedRole::User => "user",
        UnifiedRole::Assistant => "assistant",
        UnifiedRole::Tool => "tool",
    }
    .to_string();

    let tool_calls = if m.tool_calls.is_empty() {
        None
    } else {
        Some(
            m.tool_calls
                .iter()
                .map(|tc| ChatToolCall {
                    id: tc.id.clone(),
                    kind: "function".to_string(),
                    function: ChatFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    ChatMessage {
        role,
        content: Some(m.content.as_text()),
        tool_calls,
        tool_call_id: m.tool_call_id.clone(),
    }
}

/// Normalizes an Anthropic `tool_use`/`tool_result` style block list down to
/// the plain-text view a Chat message carries; used when flattening for
/// display/logging, not for the lossless Anthropic<->Chat path (see
/// `translate::anthropic`).
pub fn blocks_to_plain_text(blocks: &[UnifiedBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            UnifiedBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
