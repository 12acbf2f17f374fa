//! `POST /v1/messages` (and the `/anthropic/v1/messages` alias) — Anthropic
//! Messages wire in, Anthropic Messages wire out. Same admission pipeline as
//! the Chat endpoint; no unified-pivot translation needed since both sides
//! speak the native Anthropic shape.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;

use crate::error::GatewayError;
use crate::handlers::pipeline;
use crate::model::{LedgerDirection, LedgerEntry, TokenUsage};
use crate::redact::redact_text;
use crate::state::AppState;
use crate::telemetry::track_http_metrics;
use crate::translate::anthropic::{AnthropicBlock, AnthropicRequest};

pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<AnthropicRequest>,
) -> Response {
    let auth = match state.authenticator.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    redact_anthropic_messages(&mut req.messages);
    if let Some(system) = &mut req.system {
        let (redacted, _) = redact_text(system);
        *system = redacted;
    }

    let prompt_chars: usize = req
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(block_char_len)
        .sum();
    let estimated = TokenUsage::approximate(prompt_chars, req.max_tokens as usize);

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

    let model = req.model.clone();
    let stream_requested = req.stream.unwrap_or(false);
    req.stream = Some(stream_requested);

    if !stream_requested {
        let result = state.providers.anthropic.messages(req).await;
        let response = match result {
            Ok(mut body) => {
                if let Some(content) = body.get_mut("content").and_then(|c| c.as_array_mut()) {
                    for block in content.iter_mut() {
                        if let Some(text) = block.get_mut("text").and_then(|t| t.as_str()) {
                            let (redacted, _) = redact_text(text);
                            block["text"] = json!(redacted);
                        }
                    }
                }
                let actual = body
                    .get("usage")
                    .map(|u| TokenUsage {
                        prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    })
                    .unwrap_or(estimated);
                record_usage(&state, &auth, &model, &admission, estimated, actual).await;
                admission.finish(&state, actual.total());
                Json(body).into_response()
            }
            Err(err) => {
                admission.finish(&state, 0);
                GatewayError::BadGateway(err.to_string()).into_response()
            }
        };
        track_http_metrics("/v1/messages", &model, &admission.request_id);
        return response;
    }

    let upstream = match state.providers.anthropic.messages_stream(req).await {
        Ok(s) => s,
        Err(err) => {
            admission.finish(&state, 0);
            track_http_metrics("/v1/messages", &model, &admission.request_id);
            return GatewayError::BadGateway(err.to_string()).into_response();
        }
    };

    track_http_metrics("/v1/messages", &model, &admission.request_id);
    let cancel = admission.cancel.clone();
    let state_for_stream = state.clone();
    let auth_for_stream = auth.clone();
    let model_for_stream = model.clone();

    let body = stream! {
        let mut upstream = upstream;
        let mut completion_chars = 0usize;
        loop {
            let next = if let Some(cancel) = &cancel {
                tokio::select! {
                    item = upstream.next() => item,
                    _ = cancel.cancelled() => {
                        yield Ok::<_, Infallible>(Event::default().data(r#"{"type":"error","error":"preempted"}"#));
                        break;
                    }
                }
            } else {
                upstream.next().await
            };

            match next {
                Some(Ok(line)) => {
                    if let Some(data) = redact_anthropic_sse_line(&line, &mut completion_chars) {
                        yield Ok(Event::default().data(data));
                    }
                }
                Some(Err(e)) => {
                    yield Ok(Event::default().data(format!(r#"{{"type":"error","error":"{e}"}}"#)));
                    break;
                }
                None => break,
            }
        }

        let actual_completion = TokenUsage::approximate(0, completion_chars).completion_tokens;
        let actual = TokenUsage { prompt_tokens: estimated.prompt_tokens, completion_tokens: actual_completion };
        record_usage(&state_for_stream, &auth_for_stream, &model_for_stream, &admission, estimated, actual).await;
        admission.finish(&state_for_stream, actual.total());
    };

    Sse::new(body)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response()
}

fn block_char_len(block: &AnthropicBlock) -> usize {
    match block {
        AnthropicBlock::Text { text } => text.len(),
        AnthropicBlock::ToolUse { input, .. } => input.to_string().len(),
        AnthropicBlock::ToolResult { content, .. } => content.len(),
    }
}

fn redact_anthropic_messages(messages: &mut [crate::translate::anthropic::AnthropicMessage]) {
    for m in messages.iter_mut() {
        for block in m.content.iter_mut() {
            if let AnthropicBlock::Text { text } = block {
                let (redacted, _) = redact_text(text);
                *text = redacted;
            }
        }
    }
}

fn redact_anthropic_sse_line(line: &str, completion_chars: &mut usize) -> Option<String> {
    let json_part = line.trim().strip_prefix("data: ")?;
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(json_part) else {
        return Some(json_part.to_string());
    };
    if let Some(text) = value
        .get_mut("delta")
        .and_then(|d| d.get_mut("text"))
        .and_then(|t| t.as_str().map(str::to_string))
    {
        let (redacted, _) = redact_text(&text);
        *completion_chars += redacted.len();
        value["delta"]["text"] = json!(redacted);
    }
    serde_json::to_string(&value).ok()
}

async fn record_usage(
    state: &AppState,
    auth: &crate::model::AuthContext,
    model: &str,
    admission: &pipeline::Admission,
    estimated: TokenUsage,
    actual: TokenUsage,
) {
    state
        .quota
        .commit_usage(&admission.quota_keys, estimated.total() as f64, actual.total() as f64)
        .await;
    state.ledger.record(LedgerEntry {
        user_id: auth.account_id.clone(),
        api_key_id: auth.api_key_id.clone(),
        service_id: model.to_string(),
        prompt_tokens: actual.prompt_tokens,
        completion_tokens: actual.completion_tokens,
        direction: LedgerDirection::Consume,
        memo: "messages".to_string(),
        recorded_at: chrono::Utc::now(),
    });
}

pub async fn count_tokens(
    State(_state): State<AppState>,
    Json(req): Json<AnthropicRequest>,
) -> Response {
    let chars: usize = req
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(block_char_len)
        .sum();
    let usage = TokenUsage::approximate(chars, 0);
    Json(json!({ "input_tokens": usage.prompt_tokens })).into_response()
}
