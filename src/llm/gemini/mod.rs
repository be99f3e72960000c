// src/llm/gemini/mod.rs
// Google Gemini generateContent adapter

mod client;
mod conversion;
mod stream;
pub mod types;

pub use client::GeminiClient;
pub use conversion::{from_gemini_response, to_gemini_request};
pub use stream::GeminiStreamState;
pub use types::*;
