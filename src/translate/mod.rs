//! Protocol translation layer: a unified pivot representation plus
//! per-protocol adapters, grounded on
//! `other_examples/56eafc9a_grafbase-nexus__crates-llm-src-messages-unified.rs.rs`'s
//! module split (spec §4.6).

pub mod anthropic;
pub mod openai_chat;
pub mod responses;
pub mod shell;
pub mod stream;
pub mod unified;

pub use stream::{RequiredToolCall, ResponseEvent, ResponseStreamTranslator};
pub use unified::{
    UnifiedBlock, UnifiedContent, UnifiedFinishReason, UnifiedMessage, UnifiedRequest, UnifiedRole, UnifiedTool,
    UnifiedToolCall,
};

/// The wire protocol a client spoke on ingress, so the pipeline knows which
/// adapter to translate back through on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    OpenAIChat,
    OpenAIResponses,
    AnthropicMessages,
}

/// Normalizes any supported wire request into the unified pivot.
pub fn to_unified_messages(protocol: WireProtocol, body: &serde_json::Value) -> anyhow::Result<Vec<UnifiedMessage>> {
    match protocol {
        WireProtocol::OpenAIChat => {
            let req: openai_chat::ChatCompletionRequest = serde_json::from_value(body.clone())?;
            Ok(req.messages.iter().map(openai_chat::chat_message_to_unified).collect())
        }
        WireProtocol::OpenAIResponses => {
            let mut req: responses::ResponsesRequest = serde_json::from_value(body.clone())?;
            responses::lift_response_format(&mut req);
            Ok(responses::responses_input_to_unified(&req))
        }
        WireProtocol::AnthropicMessages => {
            let req: anthropic::AnthropicRequest = serde_json::from_value(body.clone())?;
            Ok(anthropic::anthropic_to_chat(req.system.as_deref(), &req.messages))
        }
    }
}
