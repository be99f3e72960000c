// src/llm/anthropic/mod.rs
// Anthropic messages-API adapter

mod client;
mod conversion;
mod stream;
pub mod types;

pub use client::AnthropicClient;
pub use conversion::{from_anthropic_response, to_anthropic_request};
pub use stream::AnthropicStreamState;
pub use types::*;
