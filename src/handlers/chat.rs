//! `POST /v1/chat/completions` — OpenAI Chat wire in, OpenAI Chat wire out,
//! admitted through the priority/quota/capacity pipeline. Structurally the
//! teacher's `chat_handler`: buffer the first SSE chunk before committing to
//! a streaming response, redact request and response text, track metrics on
//! every exit path.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures::StreamExt;

use crate::error::GatewayError;
use crate::handlers::pipeline;
use crate::model::{LedgerDirection, LedgerEntry, TokenUsage};
use crate::redact::redact_text;
use crate::session::check_duplicate_tool_calls;
use crate::state::AppState;
use crate::telemetry::track_http_metrics;
use crate::translate::openai_chat::{chat_message_to_unified, ChatCompletionRequest};

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<ChatCompletionRequest>,
) -> Response {
    let auth = match state.authenticator.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    for m in &mut req.messages {
        if let Some(content) = &mut m.content {
            let (redacted, _stats) = redact_text(content);
            *content = redacted;
        }
    }

    let unified_history: Vec<_> = req.messages.iter().map(chat_message_to_unified).collect();
    match check_duplicate_tool_calls(&unified_history) {
        crate::session::LoopCheck::InfiniteLoop(n) => {
            return GatewayError::InfiniteLoopDetected(n).into_response();
        }
        crate::session::LoopCheck::Warning(n) => {
            req.messages.push(crate::translate::openai_chat::ChatMessage {
                role: "system".to_string(),
                content: Some(crate::session::escalating_warning_text(n)),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        crate::session::LoopCheck::Ok => {}
    }

    let prompt_chars: usize = req.messages.iter().filter_map(|m| m.content.as_deref()).map(str::len).sum();
    let estimated = TokenUsage::approximate(prompt_chars, req.max_tokens.unwrap_or(256) as usize);

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
    let stream_requested = req.stream.unwrap_or(true);
    req.stream = Some(stream_requested);

    if !stream_requested {
        let result = state.providers.openai.chat_completion(req).await;
        let response = match result {
            Ok(mut body) => {
                for choice in &mut body.choices {
                    if let Some(message) = &mut choice.message {
                        if let Some(content) = &mut message.content {
                            let (redacted, _) = redact_text(content);
                            *content = redacted;
                        }
                    }
                }
                let actual = body
                    .usage
                    .as_ref()
                    .map(|u| TokenUsage {
                        prompt_tokens: u.prompt_tokens.unwrap_or(0) as u64,
                        completion_tokens: u.completion_tokens.unwrap_or(0) as u64,
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
        track_http_metrics("/v1/chat/completions", &model, &admission.request_id);
        return response;
    }

    let upstream = match state.providers.openai.chat_stream(req).await {
        Ok(s) => s,
        Err(err) => {
            admission.finish(&state, 0);
            track_http_metrics("/v1/chat/completions", &model, &admission.request_id);
            return GatewayError::BadGateway(err.to_string()).into_response();
        }
    };

    track_http_metrics("/v1/chat/completions", &model, &admission.request_id);
    let cancel = admission.cancel.clone();
    let state_for_stream = state.clone();
    let auth_for_stream = auth.clone();
    let model_for_stream = model.clone();

    let body = stream! {
        let mut upstream = upstream;
        let mut accumulated_completion_chars = 0usize;
        loop {
            let next = if let Some(cancel) = &cancel {
                tokio::select! {
                    item = upstream.next() => item,
                    _ = cancel.cancelled() => {
                        yield Ok::<_, Infallible>(axum::response::sse::Event::default().data(r#"{"error":"preempted"}"#));
                        break;
                    }
                }
            } else {
                upstream.next().await
            };

            match next {
                Some(Ok(line)) => {
                    if let Some((data, chars, done)) = process_and_redact_line(&line) {
                        accumulated_completion_chars += chars;
                        yield Ok(axum::response::sse::Event::default().data(data));
                        if done {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    yield Ok(axum::response::sse::Event::default().data(format!(r#"{{"error":"stream error: {e}"}}"#)));
                    break;
                }
                None => break,
            }
        }

        let actual = TokenUsage::approximate(0, accumulated_completion_chars).completion_tokens;
        let actual_usage = TokenUsage { prompt_tokens: estimated.prompt_tokens, completion_tokens: actual };
        record_usage(&state_for_stream, &auth_for_stream, &model_for_stream, &admission, estimated, actual_usage).await;
        admission.finish(&state_for_stream, actual_usage.total());
    };

    Sse::new(body)
        .keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response()
}

fn process_and_redact_line(line: &str) -> Option<(String, usize, bool)> {
    if line.trim() == "data: [DONE]" {
        return Some(("data: [DONE]".to_string(), 0, true));
    }
    let json_part = line.trim().strip_prefix("data: ")?;
    let Ok(mut chunk) = serde_json::from_str::<crate::translate::openai_chat::OpenAIStreamChunk>(json_part) else {
        return Some((format!("data: {json_part}"), 0, false));
    };
    let mut chars = 0;
    if let Some(choice) = chunk.choices.get_mut(0) {
        if let Some(delta) = choice.delta.as_mut() {
            if let Some(content) = delta.content.as_mut() {
                let (redacted, _) = redact_text(content);
                chars = redacted.len();
                *content = redacted;
            }
        }
    }
    let s = serde_json::to_string(&chunk).ok()?;
    Some((format!("data: {s}"), chars, false))
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
        memo: "chat.completions".to_string(),
        recorded_at: chrono::Utc::now(),
    });
}
