//! OpenAI Responses ⇄ Chat conversion (spec §4.6).
//!
//! `input` (string or array) normalizes to Chat `messages`; `response_format`
//! is lifted into `text.format`; tool definitions are flattened/unflattened.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::openai_chat::{chat_message_to_unified, unified_to_chat_message, ChatMessage};
use super::unified::{UnifiedMessage, UnifiedRole, UnifiedTool};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<ResponsesInputItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesInputItem {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponsesTextFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: ResponsesInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ResponsesToolDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<ResponsesTextFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesToolDef {
    pub r#type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Folds `response_format` into `text.format` if the caller used the legacy
/// field, matching spec §4.6/§4.8's normalization step.
pub fn lift_response_format(req: &mut ResponsesRequest) {
    if req.text.is_none() {
        if let Some(rf) = req.response_format.take() {
            req.text = Some(ResponsesTextFormat { format: Some(rf) });
        }
    }
}

/// Normalizes `input` (string or item array) into unified Chat messages.
/// Tool-output items (role `tool` with a `call_id`/`tool_call_id`) are
/// preserved so continuation scanning (spec §4.7) can find them.
pub fn responses_input_to_unified(req: &ResponsesRequest) -> Vec<UnifiedMessage> {
    let mut messages = Vec::new();
    if let Some(instructions) = &req.instructions {
        messages.push(UnifiedMessage::text(UnifiedRole::System, instructions.clone()));
    }
    match &req.input {
        ResponsesInput::Text(text) => {
            messages.push(UnifiedMessage::text(UnifiedRole::User, text.clone()));
        }
        ResponsesInput::Items(items) => {
            for item in items {
                let role = match item.role.as_str() {
                    "assistant" => UnifiedRole::Assistant,
                    "system" | "developer" => UnifiedRole::System,
                    "tool" | "function_call_output" => UnifiedRole::Tool,
                    _ => UnifiedRole::User,
                };
                let call_id = item.tool_call_id.clone().or_else(|| item.call_id.clone());
                messages.push(UnifiedMessage {
                    role,
                    content: super::unified::UnifiedContent::Text(item.content.clone().unwrap_or_default()),
                    tool_calls: Vec::new(),
                    tool_call_id: call_id,
                });
            }
        }
    }
    messages
}

/// Flattens Responses-shaped tool defs into the unified tool list.
pub fn flatten_tools(tools: &[ResponsesToolDef]) -> Vec<UnifiedTool> {
    tools
        .iter()
        .map(|t| UnifiedTool {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        })
        .collect()
}

/// Unflattens the unified tool list back into Responses-shaped defs.
pub fn unflatten_tools(tools: &[UnifiedTool]) -> Vec<ResponsesToolDef> {
    tools
        .iter()
        .map(|t| ResponsesToolDef {
            r#type: "function".to_string(),
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        })
        .collect()
}

/// Converts unified messages (as used internally by a session's chat
/// history) into OpenAI Chat wire messages, for handing to the Chat-shaped
/// upstream adapter.
pub fn unified_to_chat_wire(messages: &[UnifiedMessage]) -> Vec<ChatMessage> {
    messages.iter().map(unified_to_chat_message).collect()
}

pub fn chat_wire_to_unified(messages: &[ChatMessage]) -> Vec<UnifiedMessage> {
    messages.iter().map(chat_message_to_unified).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_input_becomes_single_user_message() {
        let req = ResponsesRequest {
            model: "gpt-4".into(),
            input: ResponsesInput::Text("hello".into()),
            instructions: None,
            tools: None,
            tool_choice: None,
            text: None,
            response_format: None,
            stream: false,
            max_output_tokens: None,
            temperature: None,
            previous_response_id: None,
        };
        let messages = responses_input_to_unified(&req);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, UnifiedRole::User);
    }

    #[test]
    fn response_format_lifts_into_text_format() {
        let mut req = ResponsesRequest {
            model: "gpt-4".into(),
            input: ResponsesInput::Text("x".into()),
            instructions: None,
            tools: None,
            tool_choice: None,
            text: None,
            response_format: Some(serde_json::json!({"type": "json_object"})),
            stream: false,
            max_output_tokens: None,
            temperature: None,
            previous_response_id: None,
        };
        lift_response_format(&mut req);
        assert!(req.text.is_some());
        assert!(req.response_format.is_none());
    }

    #[test]
    fn tool_defs_round_trip_through_unified() {
        let defs = vec![ResponsesToolDef {
            r#type: "function".into(),
            name: "search".into(),
            description: "search the web".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let unified = flatten_tools(&defs);
        let back = unflatten_tools(&unified);
        assert_eq!(back[0].name, "search");
    }
}
