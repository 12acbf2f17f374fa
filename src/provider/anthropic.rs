//! Anthropic Messages upstream client, grounded on the teacher's
//! `provider/openai.rs` shape (`reqwest::Client` + line-stream SSE parsing),
//! adapted to Anthropic's endpoint, auth header, and required-`max_tokens`
//! quirk (spec §4.8: missing `max_tokens` is filled in, never rejected).

use anyhow::Context;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Client, Url};
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use crate::translate::anthropic::{AnthropicRequest, DEFAULT_ANTHROPIC_MAX_TOKENS};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicProvider {
    api_key: String,
    client: Client,
    base_url: Url,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> anyhow::Result<Self> {
        let base = match base_url {
            Some(u) if !u.is_empty() => Url::parse(&u)?,
            _ => Url::parse("https://api.anthropic.com")?,
        };
        let mut builder = Client::builder();
        if base.scheme() == "https" {
            builder = builder.http2_prior_knowledge();
        }
        let client = builder.build()?;
        Ok(Self {
            api_key,
            client,
            base_url: base,
        })
    }

    fn fill_defaults(payload: &mut AnthropicRequest) {
        if payload.max_tokens == 0 {
            payload.max_tokens = DEFAULT_ANTHROPIC_MAX_TOKENS;
        }
    }

    pub async fn messages(&self, mut payload: AnthropicRequest) -> anyhow::Result<serde_json::Value> {
        Self::fill_defaults(&mut payload);
        payload.stream = Some(false);
        let url = self.base_url.join("/v1/messages")?;

        let res = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .context("anthropic send failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("anthropic error: {} - {}", status, body));
        }

        let body = res
            .json::<serde_json::Value>()
            .await
            .context("failed to parse anthropic response")?;
        Ok(body)
    }

    pub async fn messages_stream(
        &self,
        mut payload: AnthropicRequest,
    ) -> anyhow::Result<impl Stream<Item = anyhow::Result<String>>> {
        Self::fill_defaults(&mut payload);
        payload.stream = Some(true);
        let url = self.base_url.join("/v1/messages")?;

        let res = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .context("anthropic send failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("anthropic error: {} - {}", status, body));
        }

        let stream = res
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let s = StreamReader::new(stream);
        let reader = tokio::io::BufReader::new(s);
        let lines = reader.lines();
        let lines = LinesStream::new(lines).map(|l| l.map_err(|e| e.into()));
        Ok(lines)
    }
}
