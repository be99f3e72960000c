// src/llm/anthropic/client.rs
// Anthropic messages-API client (non-streaming + streaming)

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::conversion::{from_anthropic_response, to_anthropic_request};
use super::stream::AnthropicStreamState;
use super::types::AnthropicResponse;
use crate::llm::http_client::{LlmHttpClient, LlmHttpError};
use crate::llm::provider::Provider;
use crate::llm::router::ProviderClient;
use crate::llm::sse::SseParser;
use crate::llm::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    http: LlmHttpClient,
    stream_http: LlmHttpClient,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, ANTHROPIC_API_BASE.to_string())
    }

    /// Custom endpoint, used by tests and self-hosted proxies
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: LlmHttpClient::new(),
            stream_http: LlmHttpClient::new_streaming(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn complete(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, LlmHttpError> {
        let request_id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&to_anthropic_request(req, model, false))
            .map_err(|e| LlmHttpError::Transport(e.to_string()))?;
        let url = self.messages_url();

        debug!(request_id = %request_id, model = %model, "Anthropic chat request");

        let response_body = self
            .http
            .execute_with_retry(&request_id, |client| {
                client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("content-type", "application/json")
                    .body(body.clone())
            })
            .await?;

        let parsed: AnthropicResponse = serde_json::from_str(&response_body)
            .map_err(|e| LlmHttpError::Transport(format!("invalid Anthropic response: {}", e)))?;

        Ok(from_anthropic_response(parsed, model))
    }

    async fn stream(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<(), LlmHttpError> {
        let body = serde_json::to_string(&to_anthropic_request(req, model, true))
            .map_err(|e| LlmHttpError::Transport(e.to_string()))?;
        let url = self.messages_url();

        let response = self
            .stream_http
            .send_streaming(|client| {
                client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("content-type", "application/json")
                    .body(body)
            })
            .await?;

        let mut byte_stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut state = AnthropicStreamState::new(model);

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result.map_err(|e| LlmHttpError::Transport(e.to_string()))?;
            for frame in parser.feed(&bytes) {
                let Ok(event) = serde_json::from_str::<serde_json::Value>(&frame.data) else {
                    continue;
                };
                for chunk in state.on_event(&event) {
                    if tx.send(chunk).await.is_err() {
                        // Receiver dropped: client disconnected, stop pulling
                        info!("Anthropic stream receiver dropped, cancelling");
                        return Ok(());
                    }
                }
            }
            if state.is_finished() {
                break;
            }
        }

        if !state.is_finished() {
            return Err(LlmHttpError::Transport(
                "Anthropic stream ended before message_stop".into(),
            ));
        }
        Ok(())
    }
}
