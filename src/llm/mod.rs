// src/llm/mod.rs
// Provider adapter layer: OpenAI-shaped boundary over heterogeneous backends

pub mod anthropic;
pub mod gemini;
pub mod http_client;
pub mod openai_compat;
pub mod provider;
pub mod router;
pub mod sse;
pub mod types;

pub use provider::Provider;
pub use router::ProviderRouter;
pub use types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ContentPart, Delta, FunctionCall, FunctionDef, MessageContent, Tool, ToolCall,
    ToolCallDelta, Usage,
};
