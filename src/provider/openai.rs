use anyhow::Context;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Client, Url};
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

pub use crate::translate::openai_chat::{
    ChatCompletionRequest, ChatMessage, OpenAIChatCompletionResponse, OpenAIStreamChunk,
};

#[derive(Clone)]
pub struct OpenAIProvider {
    api_key: String,
    client: Client,
    base_url: Url,
}

impl OpenAIProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> anyhow::Result<Self> {
        let base = match base_url {
            Some(u) if !u.is_empty() => Url::parse(&u)?,
            _ => Url::parse("https://api.openai.com")?,
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

    pub async fn chat_stream(
        &self,
        mut payload: ChatCompletionRequest,
    ) -> anyhow::Result<impl Stream<Item = anyhow::Result<String>>> {
        let url = self.base_url.join("/v1/chat/completions")?;
        // ensure streaming
        payload.stream = Some(true);

        let res = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .context("openai send failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("openai error: {} - {}", status, body));
        }

        let stream = res
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        // Transform into line-based "data: ..." items
        let s = StreamReader::new(stream);
        let reader = tokio::io::BufReader::new(s);
        let lines = reader.lines();
        let lines = LinesStream::new(lines).map(|l| l.map_err(|e| e.into()));
        Ok(lines)
    }

    pub async fn chat_completion(
        &self,
        mut payload: ChatCompletionRequest,
    ) -> anyhow::Result<OpenAIChatCompletionResponse> {
        let url = self.base_url.join("/v1/chat/completions")?;
        payload.stream = Some(false);

        let res = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .context("openai send failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("openai error: {} - {}", status, body));
        }

        let body = res
            .json::<OpenAIChatCompletionResponse>()
            .await
            .context("failed to parse openai response")?;
        Ok(body)
    }
}
