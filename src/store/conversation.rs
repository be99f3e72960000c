// src/store/conversation.rs
// Append-only conversation log with token counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// In-memory tail kept for prompt assembly and inspection
const RECENT_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: String,
    /// String or structured multi-part content; attachments are logged
    /// as-is, never flattened away.
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Append-only per-session log: JSONL on disk plus a bounded in-memory
/// tail. Token counters aggregate exact usage when providers report it,
/// estimates otherwise.
pub struct ConversationStore {
    path: PathBuf,
    recent: Mutex<VecDeque<ConversationMessage>>,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl ConversationStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            recent: Mutex::new(VecDeque::new()),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        }
    }

    /// Append one message. Disk failures are logged, never surfaced.
    pub fn log(
        &self,
        role: &str,
        content: serde_json::Value,
        model: Option<&str>,
        client_ip: &str,
        agent_id: Option<&str>,
    ) -> ConversationMessage {
        let message = ConversationMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: role.to_string(),
            content,
            model: model.map(String::from),
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            agent_id: agent_id.map(String::from),
        };

        {
            let mut recent = self.recent.lock().expect("conversation store poisoned");
            recent.push_back(message.clone());
            while recent.len() > RECENT_CAP {
                recent.pop_front();
            }
        }

        if let Err(e) = self.append_to_disk(&message) {
            warn!(error = %e, "Failed to append conversation message");
        }
        message
    }

    fn append_to_disk(&self, message: &ConversationMessage) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)
    }

    /// Most recent `limit` messages, oldest first
    pub fn recent(&self, limit: usize) -> Vec<ConversationMessage> {
        let recent = self.recent.lock().expect("conversation store poisoned");
        recent.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Accumulate usage counters (exact or estimated)
    pub fn add_usage(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion_tokens, Ordering::Relaxed);
    }

    /// (prompt, completion) totals since startup
    pub fn usage_totals(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("conversation.jsonl"));
        (dir, store)
    }

    #[test]
    fn test_log_and_recent_order() {
        let (_dir, store) = store();
        store.log("user", "first".into(), None, "1.2.3.4", None);
        store.log("assistant", "second".into(), Some("llama3.2"), "1.2.3.4", None);

        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "first");
        assert_eq!(recent[1].content, "second");
        assert_eq!(recent[1].model.as_deref(), Some("llama3.2"));
    }

    #[test]
    fn test_disk_format_is_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.jsonl");
        let store = ConversationStore::new(path.clone());
        store.log("user", "a".into(), None, "ip", None);
        store.log("user", "b".into(), None, "ip", None);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: ConversationMessage = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.role, "user");
        }
    }

    #[test]
    fn test_multipart_content_preserved() {
        let (_dir, store) = store();
        let content = serde_json::json!([
            {"type": "text", "text": "caption"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
        ]);
        let logged = store.log("user", content.clone(), None, "ip", None);
        assert_eq!(logged.content, content);
    }

    #[test]
    fn test_usage_totals() {
        let (_dir, store) = store();
        store.add_usage(100, 40);
        store.add_usage(10, 2);
        assert_eq!(store.usage_totals(), (110, 42));
    }
}
