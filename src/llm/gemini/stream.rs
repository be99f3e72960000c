// src/llm/gemini/stream.rs
// Gemini streamGenerateContent SSE -> OpenAI chunk translation

use serde_json::Value;

use super::types::{GeminiPart, GeminiResponse};
use crate::llm::types::{ChatCompletionChunk, FunctionCallDelta, ToolCallDelta};

/// Stateful translator for one Gemini SSE stream. Gemini sends complete
/// parts per chunk, so translation is chunk-local; only the finish
/// reason needs memory.
pub struct GeminiStreamState {
    model: String,
    saw_function_call: bool,
    next_tool_index: u32,
    finished: bool,
}

impl GeminiStreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            saw_function_call: false,
            next_tool_index: 0,
            finished: false,
        }
    }

    /// Feed one SSE data payload; returns the chunks to emit
    pub fn on_chunk(&mut self, data: &Value) -> Vec<ChatCompletionChunk> {
        let Ok(response) = serde_json::from_value::<GeminiResponse>(data.clone()) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        let parts = response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[]);

        for part in parts {
            match part {
                GeminiPart::Text { text } if !text.is_empty() => {
                    out.push(ChatCompletionChunk::content(&self.model, text.clone()));
                }
                GeminiPart::FunctionCall { function_call } => {
                    self.saw_function_call = true;
                    let arguments = serde_json::to_string(&function_call.args)
                        .unwrap_or_else(|_| "{}".into());
                    out.push(ChatCompletionChunk::tool_calls(
                        &self.model,
                        vec![ToolCallDelta {
                            index: self.next_tool_index,
                            id: Some(format!("call_{}", uuid::Uuid::new_v4().simple())),
                            call_type: Some("function".into()),
                            function: Some(FunctionCallDelta {
                                name: Some(function_call.name.clone()),
                                arguments: Some(arguments),
                            }),
                        }],
                    ));
                    self.next_tool_index += 1;
                }
                _ => {}
            }
        }
        out
    }

    /// Called once after the upstream stream ends
    pub fn finish(&mut self) -> Option<ChatCompletionChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let reason = if self.saw_function_call { "tool_calls" } else { "stop" };
        Some(ChatCompletionChunk::finish(&self.model, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_text_parts_emit_content_deltas() {
        let mut state = GeminiStreamState::new("gemini-2.5-flash");
        let out = state.on_chunk(&chunk(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#,
        ));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].choices[0].delta.content.as_deref(), Some("Hel"));
        assert_eq!(out[1].choices[0].delta.content.as_deref(), Some("lo"));
    }

    #[test]
    fn test_finish_stop_without_function_calls() {
        let mut state = GeminiStreamState::new("m");
        state.on_chunk(&chunk(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"done"}]}}]}"#,
        ));
        let finish = state.finish().unwrap();
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));
        // Second call must not emit a second finish
        assert!(state.finish().is_none());
    }

    #[test]
    fn test_function_call_sets_tool_calls_finish() {
        let mut state = GeminiStreamState::new("m");
        let out = state.on_chunk(&chunk(
            r#"{"candidates":[{"content":{"role":"model","parts":[
                {"functionCall":{"name":"web_search","args":{"query":"x"}}}
            ]}}]}"#,
        ));
        assert_eq!(out.len(), 1);
        let tc = &out[0].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.index, 0);
        assert_eq!(
            tc.function.as_ref().unwrap().arguments.as_deref(),
            Some(r#"{"query":"x"}"#)
        );
        let finish = state.finish().unwrap();
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_malformed_chunk_ignored() {
        let mut state = GeminiStreamState::new("m");
        assert!(state.on_chunk(&chunk(r#"{"unrelated":true}"#)).is_empty());
    }
}
