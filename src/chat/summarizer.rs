// src/chat/summarizer.rs
// Channel-overflow summarization via the local small model

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::Summarizer;
use crate::llm::router::ProviderRouter;
use crate::llm::types::{ChatCompletionRequest, ChatMessage};

/// Prompt for condensing overflowed conversation segments
const SUMMARY_PROMPT: &str = "Summarize this conversation segment in 2-3 concise sentences. \
Focus on topics discussed, decisions made, and context worth keeping. \
Respond with ONLY the summary text, no preamble.";

/// Summarizer backed by the provider router, pinned to the configured
/// local summarization model.
pub struct LlmSummarizer {
    providers: Arc<ProviderRouter>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(providers: Arc<ProviderRouter>, model: String) -> Arc<Self> {
        Arc::new(Self { providers, model })
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, transcript: &str) -> anyhow::Result<String> {
        let request = ChatCompletionRequest {
            model: Some(self.model.clone()),
            messages: vec![
                ChatMessage::system(SUMMARY_PROMPT),
                ChatMessage::user(transcript),
            ],
            stream: None,
            tools: None,
            tool_choice: None,
            temperature: Some(0.3),
            max_tokens: Some(256),
            top_p: None,
        };

        let response = self
            .providers
            .complete(&request, &self.model)
            .await
            .map_err(|e| anyhow::anyhow!("summarization call failed: {}", e))?;

        let text = response.text();
        if text.trim().is_empty() {
            anyhow::bail!("summarizer returned empty text");
        }
        Ok(text.trim().to_string())
    }
}
