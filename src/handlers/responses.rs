//! `POST /v1/responses` and `POST /v1/responses/{id}/submit_tool_outputs`
//! (spec §4.6/§4.7) — the unifying endpoint: any configured model, OpenAI or
//! Anthropic upstream, translated through the unified pivot and re-emitted
//! as the Responses event vocabulary (`translate::stream`).
//!
//! A turn that ends in `response.required_action` closes its SSE stream
//! there; the client resumes with a fresh request to `submit_tool_outputs`,
//! which runs the next turn against the same session's accumulated history
//! and opens a new stream. `session::deliver_tool_outputs` and
//! `ResponseSession::output_tx` remain available for a future variant that
//! holds the original connection open across the tool call instead.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::handlers::pipeline::{self, Admission};
use crate::model::{LedgerDirection, LedgerEntry, TokenUsage};
use crate::provider::UpstreamAdapter;
use crate::redact::redact_text;
use crate::session::check_duplicate_tool_calls;
use crate::state::AppState;
use crate::telemetry::track_http_metrics;
use crate::translate::anthropic::chat_to_anthropic;
use crate::translate::openai_chat::{ChatCompletionRequest, ChatMessage};
use crate::translate::responses::{flatten_tools, lift_response_format, responses_input_to_unified, unified_to_chat_wire, ResponsesRequest};
use crate::translate::stream::{to_sse_payload, ResponseStreamTranslator};
use crate::translate::unified::{UnifiedContent, UnifiedMessage, UnifiedRole, UnifiedTool};

pub async fn create_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<ResponsesRequest>,
) -> Response {
    let auth = match state.authenticator.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    lift_response_format(&mut req);
    let mut history = responses_input_to_unified(&req);
    redact_history(&mut history);

    match check_duplicate_tool_calls(&history) {
        crate::session::LoopCheck::InfiniteLoop(n) => {
            return GatewayError::InfiniteLoopDetected(n).into_response();
        }
        crate::session::LoopCheck::Warning(n) => {
            history.push(UnifiedMessage::text(UnifiedRole::System, &crate::session::escalating_warning_text(n)));
        }
        crate::session::LoopCheck::Ok => {}
    }

    let tools = req.tools.as_deref().map(flatten_tools).unwrap_or_default();
    let prompt_chars: usize = history.iter().map(|m| m.content.as_text().len()).sum();
    let estimated = TokenUsage::approximate(prompt_chars, req.max_output_tokens.unwrap_or(256) as usize);

    let environment = headers.get("x-environment").and_then(|v| v.to_str().ok());
    let admission = match pipeline::admit(
        &state,
        &auth,
        &req.model,
        environment,
        &[],
        headers.get("x-priority").and_then(|v| v.to_str().ok()),
        estimated.total(),
    )
    .await
    {
        Ok(a) => a,
        Err(err) => return err.into_response(),
    };

    let adapter = state.providers.adapter_for(state.cfg.model_routes(), &req.model);
    let adapter_name = match adapter {
        UpstreamAdapter::OpenAI => "openai",
        UpstreamAdapter::Anthropic => "anthropic",
    };
    let session_id = state
        .sessions
        .create(adapter_name.to_string(), req.model.clone(), history.clone(), tools.clone());

    track_http_metrics("/v1/responses", &req.model, &admission.request_id);
    run_turn(state, auth, req.model, adapter, tools, session_id, history, admission).await
}

#[derive(Debug, Deserialize)]
pub struct SubmitToolOutputsBody {
    pub tool_outputs: Vec<ToolOutputItem>,
}

#[derive(Debug, Deserialize)]
pub struct ToolOutputItem {
    pub tool_call_id: String,
    pub output: String,
}

pub async fn submit_tool_outputs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<SubmitToolOutputsBody>,
) -> Response {
    let auth = match state.authenticator.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    let Some(session) = state.sessions.get(&session_id) else {
        return GatewayError::BadRequest(format!("unknown session {session_id}")).into_response();
    };

    let (adapter, model, mut history, tools) = {
        let guard = session.lock().await;
        let adapter = match guard.adapter.as_str() {
            "anthropic" => UpstreamAdapter::Anthropic,
            _ => UpstreamAdapter::OpenAI,
        };
        (adapter, guard.base_model.clone(), guard.history.clone(), guard.tools.clone())
    };

    for item in &body.tool_outputs {
        let (redacted, _) = redact_text(&item.output);
        let sanitized = sanitize_tool_output(&redacted);
        history.push(UnifiedMessage {
            role: UnifiedRole::Tool,
            content: UnifiedContent::Text(sanitized),
            tool_calls: Vec::new(),
            tool_call_id: Some(item.tool_call_id.clone()),
        });
    }

    match check_duplicate_tool_calls(&history) {
        crate::session::LoopCheck::InfiniteLoop(n) => {
            return GatewayError::InfiniteLoopDetected(n).into_response();
        }
        crate::session::LoopCheck::Warning(n) => {
            history.push(UnifiedMessage::text(UnifiedRole::System, &crate::session::escalating_warning_text(n)));
        }
        crate::session::LoopCheck::Ok => {}
    }

    let prompt_chars: usize = history.iter().map(|m| m.content.as_text().len()).sum();
    let estimated = TokenUsage::approximate(prompt_chars, 256);
    let environment = headers.get("x-environment").and_then(|v| v.to_str().ok());
    let admission = match pipeline::admit(&state, &auth, &model, environment, &[], None, estimated.total()).await {
        Ok(a) => a,
        Err(err) => return err.into_response(),
    };

    track_http_metrics("/v1/responses/submit_tool_outputs", &model, &admission.request_id);
    run_turn(state, auth, model, adapter, tools, session_id, history, admission).await
}

/// Raw upstream parse-error strings fed back as a tool output are a known
/// trigger for infinite retry loops (spec §4.7): the model sees the same
/// failure text, retries with the same arguments, and gets the same failure
/// text again. Any output containing one of these markers is replaced with
/// a single stable message instead of being passed through verbatim.
const PARSE_ERROR_MARKERS: &[&str] = &[
    "SyntaxError",
    "JSONDecodeError",
    "Unexpected token",
    "Unexpected end of JSON input",
    "could not parse",
    "Traceback (most recent call last)",
];

fn sanitize_tool_output(output: &str) -> String {
    if PARSE_ERROR_MARKERS.iter().any(|marker| output.contains(marker)) {
        "tool call failed: the arguments could not be parsed by the tool. Do not retry with the \
         same arguments; either correct them or report the failure."
            .to_string()
    } else {
        output.to_string()
    }
}

fn redact_history(history: &mut [UnifiedMessage]) {
    for m in history.iter_mut() {
        if let UnifiedContent::Text(text) = &mut m.content {
            let (redacted, _) = redact_text(text);
            *text = redacted;
        }
    }
}

async fn run_turn(
    state: AppState,
    auth: crate::model::AuthContext,
    model: String,
    adapter: UpstreamAdapter,
    tools: Vec<UnifiedTool>,
    session_id: String,
    history: Vec<UnifiedMessage>,
    admission: Admission,
) -> Response {
    match adapter {
        UpstreamAdapter::OpenAI => run_openai_turn(state, auth, model, tools, session_id, history, admission).await,
        UpstreamAdapter::Anthropic => run_anthropic_turn(state, auth, model, session_id, history, admission).await,
    }
}

fn chat_tools_from_unified(tools: &[UnifiedTool]) -> Option<Vec<serde_json::Value>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect(),
    )
}

async fn run_openai_turn(
    state: AppState,
    auth: crate::model::AuthContext,
    model: String,
    tools: Vec<UnifiedTool>,
    session_id: String,
    history: Vec<UnifiedMessage>,
    admission: Admission,
) -> Response {
    let messages: Vec<ChatMessage> = unified_to_chat_wire(&history);
    let req = ChatCompletionRequest {
        model: model.clone(),
        messages,
        temperature: None,
        max_tokens: None,
        stream: Some(true),
        tools: chat_tools_from_unified(&tools),
        tool_choice: None,
    };

    let upstream = match state.providers.openai.chat_stream(req).await {
        Ok(s) => s,
        Err(err) => {
            admission.finish(&state, 0);
            return GatewayError::BadGateway(err.to_string()).into_response();
        }
    };

    let cancel = admission.cancel.clone();
    let body = stream! {
        use futures::StreamExt;
        let mut upstream = upstream;
        let mut translator = ResponseStreamTranslator::new(session_id.clone());
        let mut completion_chars = 0usize;
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        loop {
            let next = if let Some(cancel) = &cancel {
                tokio::select! {
                    item = upstream.next() => item,
                    _ = cancel.cancelled() => {
                        yield Ok::<_, Infallible>(Event::default().event("response.error").data(r#"{"error":"preempted"}"#));
                        break;
                    }
                }
            } else {
                upstream.next().await
            };

            match next {
                Some(Ok(line)) => {
                    completion_chars += line.len();
                    for event in translator.on_chat_line(&line) {
                        match &event {
                            crate::translate::stream::ResponseEvent::OutputTextDelta { delta, .. } => text.push_str(delta),
                            crate::translate::stream::ResponseEvent::RequiredAction { tool_calls: calls, .. } => {
                                tool_calls = calls
                                    .iter()
                                    .map(|c| crate::translate::unified::UnifiedToolCall {
                                        id: c.id.clone(),
                                        name: c.name.clone(),
                                        arguments: c.arguments.clone(),
                                    })
                                    .collect();
                            }
                            _ => {}
                        }
                        let (name, payload) = to_sse_payload(&event);
                        yield Ok(Event::default().event(name).data(payload.to_string()));
                    }
                }
                Some(Err(e)) => {
                    yield Ok(Event::default().event("response.error").data(format!(r#"{{"error":"{e}"}}"#)));
                    break;
                }
                None => break,
            }
        }

        append_assistant_turn(&state, &session_id, text, tool_calls).await;
        let actual = TokenUsage::approximate(0, completion_chars);
        finish_turn(&state, &auth, &model, &admission, actual).await;
    };

    Sse::new(body)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response()
}

/// Anthropic upstream has no dedicated Responses-event stream translator;
/// this bridges by making one non-streaming call and replaying it as the
/// same one-shot event sequence a short, tool-call-free Chat turn would
/// produce. Multi-turn tool use against an Anthropic-routed model still
/// works through `submit_tool_outputs`, just without incremental deltas.
async fn run_anthropic_turn(
    state: AppState,
    auth: crate::model::AuthContext,
    model: String,
    session_id: String,
    history: Vec<UnifiedMessage>,
    admission: Admission,
) -> Response {
    let (system, messages) = chat_to_anthropic(&history);
    let payload = crate::translate::anthropic::AnthropicRequest {
        model: model.clone(),
        system,
        messages,
        max_tokens: 0,
        temperature: None,
        stream: Some(false),
        tools: None,
    };

    let result = state.providers.anthropic.messages(payload).await;
    let body = match result {
        Ok(body) => body,
        Err(err) => {
            admission.finish(&state, 0);
            return GatewayError::BadGateway(err.to_string()).into_response();
        }
    };

    let text: String = body
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let (redacted_text, _) = redact_text(&text);

    let actual = body
        .get("usage")
        .map(|u| TokenUsage {
            prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        })
        .unwrap_or_else(|| TokenUsage::approximate(0, redacted_text.len()));

    append_assistant_turn(&state, &session_id, redacted_text.clone(), Vec::new()).await;
    finish_turn(&state, &auth, &model, &admission, actual).await;

    let events = vec![
        json!({"type": "response.created", "response_id": session_id}),
        json!({"type": "response.output_text.delta", "delta": redacted_text}),
        json!({"type": "response.output_text.done", "text": redacted_text}),
        json!({"type": "response.completed", "finish_reason": "stop"}),
    ];
    Json(json!({ "output": events })).into_response()
}

/// Appends the turn's assistant message to the session's stored history, so
/// a later `submit_tool_outputs` continuation sees it.
async fn append_assistant_turn(
    state: &AppState,
    session_id: &str,
    text: String,
    tool_calls: Vec<crate::translate::unified::UnifiedToolCall>,
) {
    let Some(session) = state.sessions.get(session_id) else {
        return;
    };
    let mut guard = session.lock().await;
    guard.history.push(UnifiedMessage {
        role: UnifiedRole::Assistant,
        content: UnifiedContent::Text(text),
        tool_calls,
        tool_call_id: None,
    });
}

async fn finish_turn(
    state: &AppState,
    auth: &crate::model::AuthContext,
    model: &str,
    admission: &Admission,
    actual: TokenUsage,
) {
    state
        .quota
        .commit_usage(&admission.quota_keys, 0.0, actual.total() as f64)
        .await;
    state.ledger.record(LedgerEntry {
        user_id: auth.account_id.clone(),
        api_key_id: auth.api_key_id.clone(),
        service_id: model.to_string(),
        prompt_tokens: actual.prompt_tokens,
        completion_tokens: actual.completion_tokens,
        direction: LedgerDirection::Consume,
        memo: "responses".to_string(),
        recorded_at: chrono::Utc::now(),
    });
    admission.finish(state, actual.total());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_output_is_normalized() {
        let raw = "Traceback (most recent call last):\n  File \"tool.py\"\nSyntaxError: invalid syntax";
        assert!(sanitize_tool_output(raw).contains("could not be parsed"));
    }

    #[test]
    fn ordinary_output_passes_through() {
        let raw = "72F and sunny";
        assert_eq!(sanitize_tool_output(raw), raw);
    }
}
