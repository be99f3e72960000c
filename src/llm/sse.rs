// src/llm/sse.rs
// Minimal SSE line reassembly shared by the provider stream readers

/// Accumulates raw bytes and yields complete `data:` payloads (with the
/// preceding `event:` name when the provider sends one).
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
}

/// One parsed SSE frame
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk; returns every frame completed by it
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if line.is_empty() {
                self.current_event = None;
                continue;
            }
            if let Some(event) = line.strip_prefix("event: ") {
                self.current_event = Some(event.trim().to_string());
                continue;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                frames.push(SseFrame {
                    event: self.current_event.clone(),
                    data: data.to_string(),
                });
            }
        }
        frames
    }
}
