// src/llm/openai_compat.rs
// Pass-through client for OpenAI-protocol backends: OpenAI, xAI, local runner

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::llm::http_client::{LlmHttpClient, LlmHttpError};
use crate::llm::provider::Provider;
use crate::llm::router::ProviderClient;
use crate::llm::sse::SseParser;
use crate::llm::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const XAI_API_BASE: &str = "https://api.x.ai/v1";

/// Client for any backend speaking the OpenAI chat-completions protocol.
/// Requests forward directly; only model and stream fields are rewritten.
pub struct OpenAiCompatClient {
    provider: Provider,
    api_key: Option<String>,
    base_url: String,
    http: LlmHttpClient,
    stream_http: LlmHttpClient,
}

impl OpenAiCompatClient {
    pub fn openai(api_key: String) -> Self {
        Self::with_base_url(Provider::OpenAi, Some(api_key), OPENAI_API_BASE.to_string())
    }

    pub fn xai(api_key: String) -> Self {
        Self::with_base_url(Provider::XAi, Some(api_key), XAI_API_BASE.to_string())
    }

    /// Local runner needs no key
    pub fn local(base_url: String) -> Self {
        Self::with_base_url(Provider::Local, None, base_url)
    }

    pub fn with_base_url(provider: Provider, api_key: Option<String>, base_url: String) -> Self {
        Self {
            provider,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: LlmHttpClient::new(),
            stream_http: LlmHttpClient::new_streaming(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, req: &ChatCompletionRequest, model: &str, stream: bool) -> String {
        let mut body = serde_json::to_value(req).unwrap_or(Value::Object(Default::default()));
        body["model"] = Value::String(model.to_string());
        if stream {
            body["stream"] = Value::Bool(true);
        } else if let Some(obj) = body.as_object_mut() {
            obj.remove("stream");
        }
        body.to_string()
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, LlmHttpError> {
        let request_id = Uuid::new_v4().to_string();
        let body = self.build_body(req, model, false);
        let url = self.completions_url();

        debug!(request_id = %request_id, provider = %self.provider, model = %model, "Chat request");

        let response_body = self
            .http
            .execute_with_retry(&request_id, |client| {
                self.apply_auth(
                    client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .body(body.clone()),
                )
            })
            .await?;

        serde_json::from_str(&response_body)
            .map_err(|e| LlmHttpError::Transport(format!("invalid completion response: {}", e)))
    }

    async fn stream(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<(), LlmHttpError> {
        let body = self.build_body(req, model, true);
        let url = self.completions_url();

        let response = self
            .stream_http
            .send_streaming(|client| {
                self.apply_auth(
                    client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .body(body),
                )
            })
            .await?;

        let mut byte_stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut saw_finish = false;
        let mut done = false;

        'outer: while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result.map_err(|e| LlmHttpError::Transport(e.to_string()))?;
            for frame in parser.feed(&bytes) {
                if frame.data == "[DONE]" {
                    done = true;
                    break 'outer;
                }
                let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&frame.data) else {
                    continue;
                };
                if chunk
                    .choices
                    .first()
                    .map(|c| c.finish_reason.is_some())
                    .unwrap_or(false)
                {
                    saw_finish = true;
                }
                if tx.send(chunk).await.is_err() {
                    info!(provider = %self.provider, "Stream receiver dropped, cancelling");
                    return Ok(());
                }
            }
        }

        if !done && !saw_finish {
            return Err(LlmHttpError::Transport(
                "upstream stream ended without finish".into(),
            ));
        }
        // Some backends close without a finish chunk after [DONE]
        if !saw_finish {
            let _ = tx.send(ChatCompletionChunk::finish(model, "stop")).await;
        }
        Ok(())
    }
}
