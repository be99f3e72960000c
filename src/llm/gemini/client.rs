// src/llm/gemini/client.rs
// Google Gemini generateContent client (non-streaming + streaming)

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::conversion::{from_gemini_response, to_gemini_request};
use super::stream::GeminiStreamState;
use super::types::GeminiResponse;
use crate::llm::http_client::{LlmHttpClient, LlmHttpError};
use crate::llm::provider::Provider;
use crate::llm::router::ProviderClient;
use crate::llm::sse::SseParser;
use crate::llm::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    http: LlmHttpClient,
    stream_http: LlmHttpClient,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, GEMINI_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: LlmHttpClient::new(),
            stream_http: LlmHttpClient::new_streaming(),
        }
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn complete(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, LlmHttpError> {
        let request_id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&to_gemini_request(req))
            .map_err(|e| LlmHttpError::Transport(e.to_string()))?;
        // Gemini authenticates via query-string key, not a Bearer header
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        debug!(request_id = %request_id, model = %model, "Gemini chat request");

        let response_body = self
            .http
            .execute_with_retry(&request_id, |client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .body(body.clone())
            })
            .await?;

        let parsed: GeminiResponse = serde_json::from_str(&response_body)
            .map_err(|e| LlmHttpError::Transport(format!("invalid Gemini response: {}", e)))?;

        Ok(from_gemini_response(parsed, model))
    }

    async fn stream(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<(), LlmHttpError> {
        let body = serde_json::to_string(&to_gemini_request(req))
            .map_err(|e| LlmHttpError::Transport(e.to_string()))?;
        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );

        let response = self
            .stream_http
            .send_streaming(|client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .body(body)
            })
            .await?;

        let mut byte_stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut state = GeminiStreamState::new(model);

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result.map_err(|e| LlmHttpError::Transport(e.to_string()))?;
            for frame in parser.feed(&bytes) {
                let Ok(data) = serde_json::from_str::<serde_json::Value>(&frame.data) else {
                    continue;
                };
                for chunk in state.on_chunk(&data) {
                    if tx.send(chunk).await.is_err() {
                        info!("Gemini stream receiver dropped, cancelling");
                        return Ok(());
                    }
                }
            }
        }

        // Upstream closed: emit the single finish chunk
        if let Some(finish) = state.finish() {
            let _ = tx.send(finish).await;
        }
        Ok(())
    }
}
