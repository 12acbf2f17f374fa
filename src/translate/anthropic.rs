//! Chat ⇄ Anthropic Native conversion (spec §4.6).
//!
//! - Chat -> Anthropic: first system message becomes the `system` field;
//!   `tool` role messages become `tool_result` content blocks on a user
//!   message; assistant messages with tool calls become `tool_use` content
//!   blocks; content strings become `{type:text,text}` blocks.
//! - Anthropic -> Chat: the reverse.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::unified::{UnifiedBlock, UnifiedContent, UnifiedMessage, UnifiedRole, UnifiedToolCall};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnthropicRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

/// Default `max_tokens` filled in when absent, per spec §4.8.
pub const DEFAULT_ANTHROPIC_MAX_TOKENS: u32 = 4096;

/// Converts a Chat-shaped message list into (system, Anthropic messages).
pub fn chat_to_anthropic(messages: &[UnifiedMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system = None;
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for m in messages {
        match m.role {
            UnifiedRole::System => {
                if system.is_none() {
                    system = Some(m.content.as_text());
                }
            }
            UnifiedRole::Tool => {
                let block = AnthropicBlock::ToolResult {
                    tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                    content: m.content.as_text(),
                    is_error: None,
                };
                // Tool results ride on a `user` message in Anthropic's
                // shape; merge into the previous user message if one was
                // just appended for another tool result in the same turn.
                if let Some(last) = out.last_mut() {
                    if last.role == "user" && matches!(last.content.last(), Some(AnthropicBlock::ToolResult { .. })) {
                        last.content.push(block);
                        continue;
                    }
                }
                out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: vec![block],
                });
            }
            UnifiedRole::Assistant => {
                let mut blocks = Vec::new();
                if let UnifiedContent::Text(text) = &m.content {
                    if !text.is_empty() {
                        blocks.push(AnthropicBlock::Text { text: text.clone() });
                    }
                }
                for tc in &m.tool_calls {
                    let input: Value = serde_json::from_str(&tc.arguments).unwrap_or(Value::Null);
                    blocks.push(AnthropicBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input,
                    });
                }
                out.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: blocks,
                });
            }
            UnifiedRole::User => {
                out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: vec![AnthropicBlock::Text {
                        text: m.content.as_text(),
                    }],
                });
            }
        }
    }

    (system, out)
}

/// Converts Anthropic-shaped messages (plus an optional system field) back
/// into the unified Chat message list.
pub fn anthropic_to_chat(system: Option<&str>, messages: &[AnthropicMessage]) -> Vec<UnifiedMessage> {
    let mut out = Vec::new();
    if let Some(sys) = system {
        out.push(UnifiedMessage::text(UnifiedRole::System, sys));
    }

    for m in messages {
        let role = match m.role.as_str() {
            "assistant" => UnifiedRole::Assistant,
            _ => UnifiedRole::User,
        };

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_result_messages = Vec::new();

        for block in &m.content {
            match block {
                AnthropicBlock::Text { text } => text_parts.push(text.clone()),
                AnthropicBlock::ToolUse { id, name, input } => tool_calls.push(UnifiedToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: crate::translate::shell::normalize_shell_arguments(
                        name,
                        &serde_json::to_string(input).unwrap_or_default(),
                    ),
                }),
                AnthropicBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => tool_result_messages.push(UnifiedMessage {
                    role: UnifiedRole::Tool,
                    content: UnifiedContent::Text(content.clone()),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(tool_use_id.clone()),
                }),
            }
        }

        if !tool_result_messages.is_empty() {
            out.extend(tool_result_messages);
            continue;
        }

        out.push(UnifiedMessage {
            role,
            content: UnifiedContent::Text(text_parts.join("")),
            tool_calls,
            tool_call_id: None,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_roles_and_order() {
        let original = vec![
            UnifiedMessage::text(UnifiedRole::System, "be terse"),
            UnifiedMessage::text(UnifiedRole::User, "hello"),
            UnifiedMessage::text(UnifiedRole::Assistant, "hi there"),
        ];
        let (system, anthropic) = chat_to_anthropic(&original);
        let restored = anthropic_to_chat(system.as_deref(), &anthropic);
        assert_eq!(restored.len(), 3);
        assert_eq!(restored[0].role, UnifiedRole::System);
        assert_eq!(restored[1].role, UnifiedRole::User);
        assert_eq!(restored[2].role, UnifiedRole::Assistant);
        assert_eq!(restored[1].content.as_text(), "hello");
    }

    #[test]
    fn tool_call_round_trips_through_tool_use_block() {
        let mut assistant = UnifiedMessage::text(UnifiedRole::Assistant, "");
        assistant.tool_calls.push(UnifiedToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: r#"{"city":"Paris"}"#.into(),
        });
        let (_, anthropic) = chat_to_anthropic(&[assistant]);
        assert!(matches!(anthropic[0].content[0], AnthropicBlock::ToolUse { .. }));
        let restored = anthropic_to_chat(None, &anthropic);
        assert_eq!(restored[0].tool_calls[0].name, "get_weather");
    }

    #[test]
    fn tool_role_message_becomes_tool_result_block() {
        let tool_msg = UnifiedMessage {
            role: UnifiedRole::Tool,
            content: UnifiedContent::Text("72F".into()),
            tool_calls: Vec::new(),
            tool_call_id: Some("call_1".into()),
        };
        let (_, anthropic) = chat_to_anthropic(&[tool_msg]);
        assert_eq!(anthropic.len(), 1);
        assert_eq!(anthropic[0].role, "user");
        assert!(matches!(anthropic[0].content[0], AnthropicBlock::ToolResult { .. }));
    }
}
