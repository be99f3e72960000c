// src/llm/anthropic/stream.rs
// Anthropic SSE events -> OpenAI chunk translation
//
// Tool-call arguments are accumulated across input_json_delta events and
// emitted as a single chunk at content_block_stop. Partial JSON fragments
// cannot be re-serialized reliably by intermediate layers, so per-delta
// emission truncates arguments downstream.

use serde_json::Value;

use crate::llm::types::{ChatCompletionChunk, FunctionCallDelta, ToolCallDelta};

/// What kind of content block the stream is currently inside
#[derive(Debug, Clone, PartialEq)]
enum BlockKind {
    None,
    Text,
    Thinking,
    ToolUse,
}

/// Stateful translator for one Anthropic SSE stream
pub struct AnthropicStreamState {
    model: String,
    current_block: BlockKind,
    /// OpenAI tool_calls index of the block being accumulated
    tool_index: u32,
    /// Accumulated partial_json for the active tool_use block
    arguments: String,
    /// Whether any tool_use block was seen (drives the finish reason)
    saw_tool_use: bool,
    /// Set once a finish chunk has been emitted
    finished: bool,
}

impl AnthropicStreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            current_block: BlockKind::None,
            tool_index: 0,
            arguments: String::new(),
            saw_tool_use: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one parsed SSE event; returns the OpenAI chunks to emit
    pub fn on_event(&mut self, event: &Value) -> Vec<ChatCompletionChunk> {
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match event_type {
            "content_block_start" => self.on_block_start(event),
            "content_block_delta" => self.on_block_delta(event),
            "content_block_stop" => self.on_block_stop(),
            "message_delta" => self.on_message_delta(event),
            "message_stop" => self.on_message_stop(),
            _ => Vec::new(),
        }
    }

    fn on_block_start(&mut self, event: &Value) -> Vec<ChatCompletionChunk> {
        let Some(block) = event.get("content_block") else {
            return Vec::new();
        };
        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_use") => {
                self.current_block = BlockKind::ToolUse;
                self.arguments.clear();
                self.saw_tool_use = true;

                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                vec![ChatCompletionChunk::tool_calls(
                    &self.model,
                    vec![ToolCallDelta {
                        index: self.tool_index,
                        id: Some(id.to_string()),
                        call_type: Some("function".into()),
                        function: Some(FunctionCallDelta {
                            name: Some(name.to_string()),
                            arguments: Some(String::new()),
                        }),
                    }],
                )]
            }
            Some("thinking") => {
                self.current_block = BlockKind::Thinking;
                Vec::new()
            }
            _ => {
                self.current_block = BlockKind::Text;
                Vec::new()
            }
        }
    }

    fn on_block_delta(&mut self, event: &Value) -> Vec<ChatCompletionChunk> {
        let Some(delta) = event.get("delta") else {
            return Vec::new();
        };
        match delta.get("type").and_then(|t| t.as_str()) {
            Some("text_delta") => {
                // Thinking deltas are never forwarded
                if self.current_block == BlockKind::Thinking {
                    return Vec::new();
                }
                delta
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(|text| vec![ChatCompletionChunk::content(&self.model, text)])
                    .unwrap_or_default()
            }
            Some("input_json_delta") => {
                // Accumulate only; emission happens at content_block_stop
                if let Some(partial) = delta.get("partial_json").and_then(|p| p.as_str()) {
                    self.arguments.push_str(partial);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_block_stop(&mut self) -> Vec<ChatCompletionChunk> {
        if self.current_block != BlockKind::ToolUse {
            self.current_block = BlockKind::None;
            return Vec::new();
        }

        let arguments = if self.arguments.is_empty() {
            "{}".to_string()
        } else {
            std::mem::take(&mut self.arguments)
        };
        let chunk = ChatCompletionChunk::tool_calls(
            &self.model,
            vec![ToolCallDelta {
                index: self.tool_index,
                id: None,
                call_type: None,
                function: Some(FunctionCallDelta {
                    name: None,
                    arguments: Some(arguments),
                }),
            }],
        );
        self.tool_index += 1;
        self.arguments.clear();
        self.current_block = BlockKind::None;
        vec![chunk]
    }

    fn on_message_delta(&mut self, event: &Value) -> Vec<ChatCompletionChunk> {
        let stop_reason = event
            .get("delta")
            .and_then(|d| d.get("stop_reason"))
            .and_then(|s| s.as_str());
        match stop_reason {
            Some("tool_use") => self.emit_finish("tool_calls"),
            Some(_) => self.emit_finish(if self.saw_tool_use { "tool_calls" } else { "stop" }),
            None => Vec::new(),
        }
    }

    fn on_message_stop(&mut self) -> Vec<ChatCompletionChunk> {
        // message_delta usually carried the stop_reason already
        let reason = if self.saw_tool_use { "tool_calls" } else { "stop" };
        self.emit_finish(reason)
    }

    fn emit_finish(&mut self, reason: &str) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![ChatCompletionChunk::finish(&self.model, reason)]
    }
}
