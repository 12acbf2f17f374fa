//! Streaming state machine that turns OpenAI Chat SSE chunks into the
//! Responses event vocabulary (spec §4.6/§4.7), generalized from the
//! teacher's `chat_handler` streaming loop (`process_stream_line` +
//! buffer-first-chunk pattern in the original `main.rs`), which only ever
//! redacted and forwarded; here the same "pull a line, decide, yield"
//! shape parses, accumulates tool-call argument fragments across chunks,
//! and re-emits a different event vocabulary.

use serde::Serialize;
use serde_json::Value;

use super::openai_chat::{finish_reason_from_str, OpenAIStreamChunk};
use super::unified::UnifiedFinishReason;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ResponseEvent {
    #[serde(rename = "response.created")]
    Created { response_id: String, sequence_number: u64 },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String, sequence_number: u64 },
    #[serde(rename = "response.output_text.done")]
    OutputTextDone { text: String, sequence_number: u64 },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        item_id: String,
        call_id: String,
        name: String,
        sequence_number: u64,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        item_id: String,
        delta: String,
        sequence_number: u64,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        item_id: String,
        arguments: String,
        sequence_number: u64,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item_id: String, sequence_number: u64 },
    #[serde(rename = "response.required_action")]
    RequiredAction {
        response_id: String,
        tool_calls: Vec<RequiredToolCall>,
        sequence_number: u64,
    },
    #[serde(rename = "response.completed")]
    Completed {
        response_id: String,
        finish_reason: String,
        sequence_number: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RequiredToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ResponseEvent {
    /// The SSE `event:` field name, matching the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            ResponseEvent::Created { .. } => "response.created",
            ResponseEvent::OutputTextDelta { .. } => "response.output_text.delta",
            ResponseEvent::OutputTextDone { .. } => "response.output_text.done",
            ResponseEvent::OutputItemAdded { .. } => "response.output_item.added",
            ResponseEvent::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            ResponseEvent::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            ResponseEvent::OutputItemDone { .. } => "response.output_item.done",
            ResponseEvent::RequiredAction { .. } => "response.required_action",
            ResponseEvent::Completed { .. } => "response.completed",
        }
    }
}

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: Option<String>,
    /// Responses `item_id` fixed at announce time; subsequent delta/done
    /// events reuse it even if the upstream id field isn't repeated on
    /// later chunks.
    item_id: Option<String>,
    name: Option<String>,
    arguments: String,
    announced: bool,
}

/// Accumulates one streamed response's worth of Chat chunks and emits
/// Responses-shaped events. `sequence_number` starts at 0 and is strictly
/// increasing across the whole stream, per spec §8.
pub struct ResponseStreamTranslator {
    response_id: String,
    sequence: u64,
    announced_created: bool,
    text_buffer: String,
    tool_calls: Vec<ToolCallBuffer>,
    done: bool,
}

impl ResponseStreamTranslator {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            sequence: 0,
            announced_created: false,
            text_buffer: String::new(),
            tool_calls: Vec::new(),
            done: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.sequence;
        self.sequence += 1;
        s
    }

    /// Feeds one raw Chat SSE line (`"data: {...}"` or `"data: [DONE]"`).
    /// Returns zero or more Responses events to forward.
    pub fn on_chat_line(&mut self, line: &str) -> Vec<ResponseEvent> {
        if self.done {
            return Vec::new();
        }
        let mut out = Vec::new();
        if !self.announced_created {
            self.announced_created = true;
            out.push(ResponseEvent::Created {
                response_id: self.response_id.clone(),
                sequence_number: self.next_seq(),
            });
        }

        let trimmed = line.trim();
        if trimmed == "data: [DONE]" {
            if !self.done {
                out.extend(self.finalize(UnifiedFinishReason::Stop, false));
            }
            return out;
        }

        let Some(json_part) = trimmed.strip_prefix("data: ") else {
            return out;
        };
        let Ok(chunk) = serde_json::from_str::<OpenAIStreamChunk>(json_part) else {
            return out;
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            return out;
        };

        if let Some(delta) = &choice.delta {
            if let Some(content) = &delta.content {
                if !content.is_empty() {
                    self.text_buffer.push_str(content);
                    out.push(ResponseEvent::OutputTextDelta {
                        delta: content.clone(),
                        sequence_number: self.next_seq(),
                    });
                }
            }
            if let Some(tool_calls) = &delta.tool_calls {
                for tc in tool_calls {
                    while self.tool_calls.len() <= tc.index {
                        self.tool_calls.push(ToolCallBuffer::default());
                    }
                    let index = tc.index;
                    {
                        let buf = &mut self.tool_calls[index];
                        if let Some(id) = &tc.id {
                            buf.id = Some(id.clone());
                        }
                        if let Some(func) = &tc.function {
                            if let Some(name) = &func.name {
                                buf.name = Some(name.clone());
                            }
                        }
                    }

                    if !self.tool_calls[index].announced {
                        let buf = &mut self.tool_calls[index];
                        buf.announced = true;
                        let item_id = buf.id.clone().unwrap_or_else(|| format!("fc_{index}"));
                        buf.item_id = Some(item_id.clone());
                        let name = buf.name.clone().unwrap_or_default();
                        out.push(ResponseEvent::OutputItemAdded {
                            item_id: item_id.clone(),
                            call_id: item_id,
                            name,
                            sequence_number: self.next_seq(),
                        });
                    }

                    // Emit one delta per incoming fragment, preserving the
                    // order fragments arrive in, instead of batching the
                    // whole call's arguments into one event at the end.
                    if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_ref()) {
                        if !args.is_empty() {
                            let buf = &mut self.tool_calls[index];
                            buf.arguments.push_str(args);
                            let item_id = buf.item_id.clone().unwrap_or_else(|| format!("fc_{index}"));
                            out.push(ResponseEvent::FunctionCallArgumentsDelta {
                                item_id,
                                delta: args.clone(),
                                sequence_number: self.next_seq(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(finish_reason) = &choice.finish_reason {
            let reason = finish_reason_from_str(finish_reason);
            out.extend(self.finalize(reason, true));
        }

        out
    }

    fn finalize(&mut self, reason: UnifiedFinishReason, has_explicit_reason: bool) -> Vec<ResponseEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out = Vec::new();

        if matches!(reason, UnifiedFinishReason::ToolCalls) && !self.tool_calls.is_empty() {
            let mut required = Vec::new();
            for (idx, buf) in self.tool_calls.iter_mut().enumerate() {
                // Fragments were already streamed as they arrived in
                // `on_chat_line`; only the terminal `done` events are left.
                let item_id = buf.item_id.clone().unwrap_or_else(|| format!("fc_{idx}"));
                out.push(ResponseEvent::FunctionCallArgumentsDone {
                    item_id: item_id.clone(),
                    arguments: buf.arguments.clone(),
                    sequence_number: self.sequence,
                });
                self.sequence += 1;
                out.push(ResponseEvent::OutputItemDone {
                    item_id: item_id.clone(),
                    sequence_number: self.sequence,
                });
                self.sequence += 1;
                required.push(RequiredToolCall {
                    id: item_id,
                    name: buf.name.clone().unwrap_or_default(),
                    arguments: buf.arguments.clone(),
                });
            }
            out.push(ResponseEvent::RequiredAction {
                response_id: self.response_id.clone(),
                tool_calls: required,
                sequence_number: self.sequence,
            });
            self.sequence += 1;
            return out;
        }

        if !self.text_buffer.is_empty() {
            out.push(ResponseEvent::OutputTextDone {
                text: self.text_buffer.clone(),
                sequence_number: self.sequence,
            });
            self.sequence += 1;
        }
        let finish_str = if has_explicit_reason {
            reason.to_string()
        } else {
            UnifiedFinishReason::Stop.to_string()
        };
        out.push(ResponseEvent::Completed {
            response_id: self.response_id.clone(),
            finish_reason: finish_str,
            sequence_number: self.sequence,
        });
        self.sequence += 1;
        out
    }
}

/// Renders an event as an SSE frame body (`event: ...\ndata: ...`), the
/// wire shape consumers attach to an `axum::response::sse::Event`.
pub fn to_sse_payload(event: &ResponseEvent) -> (String, Value) {
    let payload = serde_json::to_value(event).unwrap_or(Value::Null);
    (event.name().to_string(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_then_stop_emits_created_delta_done_completed() {
        let mut t = ResponseStreamTranslator::new("resp_1");
        let mut events = t.on_chat_line(r#"data: {"id":"x","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#);
        events.extend(t.on_chat_line(
            r#"data: {"id":"x","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ));
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_text.delta",
                "response.output_text.done",
                "response.completed",
            ]
        );
    }

    #[test]
    fn tool_call_delta_accumulates_across_chunks_then_required_action() {
        let mut t = ResponseStreamTranslator::new("resp_2");
        let mut events = t.on_chat_line(
            r#"data: {"id":"x","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":"{\"ci"}}]},"finish_reason":null}]}"#,
        );
        events.extend(t.on_chat_line(
            r#"data: {"id":"x","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ty\":\"nyc\"}"}}]},"finish_reason":null}]}"#,
        ));
        events.extend(t.on_chat_line(
            r#"data: {"id":"x","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        ));

        // Each upstream fragment is its own delta, in arrival order, not one
        // combined delta batched at the end.
        let deltas: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::FunctionCallArgumentsDelta { delta, .. } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![r#"{"ci"#.to_string(), r#"ty":"nyc"}"#.to_string()]);

        assert!(events.iter().any(|e| e.name() == "response.required_action"));
        if let Some(ResponseEvent::RequiredAction { tool_calls, .. }) =
            events.iter().find(|e| e.name() == "response.required_action")
        {
            assert_eq!(tool_calls[0].arguments, r#"{"city":"nyc"}"#);
        } else {
            panic!("expected required_action event");
        }
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let mut t = ResponseStreamTranslator::new("resp_3");
        let mut seqs = Vec::new();
        for e in t.on_chat_line(r#"data: {"id":"x","choices":[{"index":0,"delta":{"content":"a"},"finish_reason":null}]}"#) {
            seqs.push(sequence_of(&e));
        }
        for e in t.on_chat_line(r#"data: {"id":"x","choices":[{"index":0,"delta":{"content":"b"},"finish_reason":"stop"}]}"#) {
            seqs.push(sequence_of(&e));
        }
        for w in seqs.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    fn sequence_of(e: &ResponseEvent) -> u64 {
        match e {
            ResponseEvent::Created { sequence_number, .. } => *sequence_number,
            ResponseEvent::OutputTextDelta { sequence_number, .. } => *sequence_number,
            ResponseEvent::OutputTextDone { sequence_number, .. } => *sequence_number,
            ResponseEvent::OutputItemAdded { sequence_number, .. } => *sequence_number,
            ResponseEvent::FunctionCallArgumentsDelta { sequence_number, .. } => *sequence_number,
            ResponseEvent::FunctionCallArgumentsDone { sequence_number, .. } => *sequence_number,
            ResponseEvent::OutputItemDone { sequence_number, .. } => *sequence_number,
            ResponseEvent::RequiredAction { sequence_number, .. } => *sequence_number,
            ResponseEvent::Completed { sequence_number, .. } => *sequence_number,
        }
    }
}
