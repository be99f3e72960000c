// src/context/mod.rs
// Per-channel rolling conversation buffers with overflow summarization
// and idle eviction

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::chat::memory::{MemoryArchiveEntry, MemoryCollaborator};
use crate::llm::types::ChatMessage;

/// Shards for per-channel lock contention
const SHARD_COUNT: usize = 16;

/// Summarizes overflowed transcript segments; implemented by the LLM
/// router over the local small model.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Buffered messages per channel at quiescence
    pub max_window: usize,
    /// Oldest messages summarized away on overflow
    pub overflow_batch: usize,
    /// Idle gap that marks a conversation as resuming / evictable
    pub idle_timeout: Duration,
    /// Per-message content cap in bytes
    pub content_cap: usize,
    /// Merged summary length cap in characters
    pub summary_cap: usize,
    /// Minimum interval between eviction scans
    pub scan_interval: Duration,
    /// Per-message cap when building summarization transcripts
    pub transcript_message_cap: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_window: 20,
            overflow_batch: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            content_cap: 32 * 1024,
            summary_cap: 2000,
            scan_interval: Duration::from_secs(60),
            transcript_message_cap: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ChannelState {
    buffer: Vec<BufferedMessage>,
    summary: Option<String>,
    last_activity: Option<DateTime<Utc>>,
    resuming: bool,
}

/// Rolling context for every bridge channel, sharded by channel key.
/// All mutation happens under the owning shard's mutex; summarization
/// and archival run as fire-and-forget tasks outside any lock.
pub struct ConvContext {
    shards: Vec<Mutex<HashMap<String, ChannelState>>>,
    config: ContextConfig,
    summarizer: Arc<dyn Summarizer>,
    memory: Arc<dyn MemoryCollaborator>,
    last_scan: Mutex<Instant>,
    summarizations_spawned: AtomicUsize,
}

impl ConvContext {
    pub fn new(
        config: ContextConfig,
        summarizer: Arc<dyn Summarizer>,
        memory: Arc<dyn MemoryCollaborator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            config,
            summarizer,
            memory,
            last_scan: Mutex::new(Instant::now()),
            summarizations_spawned: AtomicUsize::new(0),
        })
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, ChannelState>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Append a message to a channel. Overflow beyond the window spawns
    /// a background summarization of the oldest batch.
    pub fn add_message(self: &Arc<Self>, key: &str, role: &str, content: &str) {
        let now = Utc::now();
        let content = cap_bytes(content, self.config.content_cap);
        let idle = ChronoDuration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(1800));

        let overflow = {
            let mut shard = self.shard(key).lock().expect("context shard poisoned");
            let state = shard.entry(key.to_string()).or_default();

            if role == "user"
                && let Some(last) = state.last_activity
                && now - last > idle
            {
                state.resuming = true;
            }

            state.buffer.push(BufferedMessage {
                role: role.to_string(),
                content,
                timestamp: now,
            });
            state.last_activity = Some(now);

            if state.buffer.len() > self.config.max_window {
                let batch: Vec<BufferedMessage> =
                    state.buffer.drain(..self.config.overflow_batch).collect();
                Some(batch)
            } else {
                None
            }
        };

        if let Some(batch) = overflow {
            self.summarizations_spawned.fetch_add(1, Ordering::SeqCst);
            let ctx = Arc::clone(self);
            let key = key.to_string();
            tokio::spawn(async move {
                ctx.summarize_and_store(&key, batch).await;
            });
        }

        self.maybe_evict();
    }

    /// Ordered history for LLM consumption. Messages older than the
    /// idle timeout are filtered; a stored summary is prepended as one
    /// synthesized system message. The resuming flag clears after one
    /// fetch.
    pub fn get_history(self: &Arc<Self>, key: &str) -> Vec<ChatMessage> {
        let now = Utc::now();
        let idle = ChronoDuration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(1800));

        let mut shard = self.shard(key).lock().expect("context shard poisoned");
        let Some(state) = shard.get_mut(key) else {
            return Vec::new();
        };

        let mut history = Vec::new();
        if let Some(ref summary) = state.summary {
            let text = if state.resuming {
                format!(
                    "[Context: This conversation is resuming after a break. Previous context: {}]",
                    summary
                )
            } else {
                format!("[Previous conversation context: {}]", summary)
            };
            history.push(ChatMessage::system(text));
        }
        state.resuming = false;

        for msg in &state.buffer {
            if now - msg.timestamp > idle {
                continue;
            }
            history.push(match msg.role.as_str() {
                "assistant" => ChatMessage::assistant(msg.content.clone()),
                "system" => ChatMessage::system(msg.content.clone()),
                _ => ChatMessage::user(msg.content.clone()),
            });
        }
        history
    }

    pub fn clear(&self, key: &str) {
        self.shard(key)
            .lock()
            .expect("context shard poisoned")
            .remove(key);
    }

    pub fn clear_all(&self) {
        for shard in &self.shards {
            shard.lock().expect("context shard poisoned").clear();
        }
    }

    /// Number of buffered messages for a channel (0 when absent)
    pub fn buffer_len(&self, key: &str) -> usize {
        self.shard(key)
            .lock()
            .expect("context shard poisoned")
            .get(key)
            .map(|s| s.buffer.len())
            .unwrap_or(0)
    }

    /// Current merged summary for a channel
    pub fn summary(&self, key: &str) -> Option<String> {
        self.shard(key)
            .lock()
            .expect("context shard poisoned")
            .get(key)
            .and_then(|s| s.summary.clone())
    }

    /// Background summarizations spawned since startup
    pub fn summarizations_spawned(&self) -> usize {
        self.summarizations_spawned.load(Ordering::SeqCst)
    }

    /// Summarize an overflow batch and merge into the channel summary.
    /// Failures are logged and discarded; the message flow never blocks
    /// on this.
    async fn summarize_and_store(&self, key: &str, overflow: Vec<BufferedMessage>) {
        let transcript: String = overflow
            .iter()
            .map(|m| {
                format!(
                    "{}: {}",
                    m.role.to_uppercase(),
                    cap_chars(&m.content, self.config.transcript_message_cap)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let new_summary = match self.summarizer.summarize(&transcript).await {
            Ok(s) => s,
            Err(e) => {
                warn!(channel = %key, error = %e, "Channel summarization failed");
                return;
            }
        };

        let mut shard = self.shard(key).lock().expect("context shard poisoned");
        let Some(state) = shard.get_mut(key) else {
            return;
        };
        let merged = match state.summary.take() {
            Some(prev) => format!("{} Then: {}", prev, new_summary),
            None => new_summary,
        };
        // Over the cap, the newest tail wins
        state.summary = Some(keep_suffix(&merged, self.config.summary_cap));
        debug!(channel = %key, "Channel summary updated");
    }

    /// Evict idle channels, archiving their summaries. Runs at most once
    /// per scan interval regardless of traffic.
    fn maybe_evict(self: &Arc<Self>) {
        {
            let mut last = self.last_scan.lock().expect("scan clock poisoned");
            if last.elapsed() < self.config.scan_interval {
                return;
            }
            *last = Instant::now();
        }

        let now = Utc::now();
        let idle = ChronoDuration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(1800));

        let mut archives: Vec<(String, String)> = Vec::new();
        for shard in &self.shards {
            let mut map = shard.lock().expect("context shard poisoned");
            map.retain(|key, state| {
                let last_ts = state.buffer.last().map(|m| m.timestamp).or(state.last_activity);
                let expired = last_ts.map(|t| now - t > idle).unwrap_or(true);
                if expired {
                    if let Some(summary) = state.summary.take() {
                        archives.push((key.clone(), summary));
                    }
                    debug!(channel = %key, "Idle channel evicted");
                }
                !expired
            });
        }

        if !archives.is_empty() {
            let memory = Arc::clone(&self.memory);
            tokio::spawn(async move {
                for (key, summary) in archives {
                    memory
                        .archive(MemoryArchiveEntry {
                            text: format!("Bridge conversation ({}): {}", key, summary),
                            category: "episode".into(),
                            source: "bridge-summary".into(),
                            importance: 0.5,
                        })
                        .await;
                }
            });
        }
    }
}

/// Truncate to a byte budget on a char boundary
fn cap_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Truncate to a character budget
fn cap_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Keep the trailing `max` characters
fn keep_suffix(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::memory::NoopMemory;
    use std::sync::Mutex as StdMutex;

    struct FakeSummarizer {
        calls: AtomicUsize,
        reply: String,
    }

    impl FakeSummarizer {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: reply.to_string(),
            })
        }
    }

    #[async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(&self, _transcript: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct RecordingMemory {
        archived: StdMutex<Vec<MemoryArchiveEntry>>,
    }

    #[async_trait]
    impl MemoryCollaborator for RecordingMemory {
        async fn enrich(
            &self,
            _ctx: crate::chat::memory::EnrichmentContext<'_>,
        ) -> Vec<ChatMessage> {
            Vec::new()
        }
        async fn extract(&self, _u: &str, _a: &str, _id: Option<&str>) {}
        async fn archive(&self, entry: MemoryArchiveEntry) {
            self.archived.lock().unwrap().push(entry);
        }
    }

    fn context(config: ContextConfig) -> (Arc<ConvContext>, Arc<FakeSummarizer>) {
        let summarizer = FakeSummarizer::new("they talked about tests");
        let ctx = ConvContext::new(config, summarizer.clone(), Arc::new(NoopMemory));
        (ctx, summarizer)
    }

    // ============================================================================
    // Round-trip and window behavior
    // ============================================================================

    #[tokio::test]
    async fn test_clear_add_get_roundtrip() {
        let (ctx, _) = context(ContextConfig::default());
        ctx.clear("c1");
        ctx.add_message("c1", "user", "hello");
        ctx.add_message("c1", "assistant", "hi there");

        let history = ctx.get_history("c1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].text(), "hello");
        assert_eq!(history[1].role, "assistant");
        // No summary prefix on a fresh channel
        assert!(history.iter().all(|m| m.role != "system"));
    }

    #[tokio::test]
    async fn test_overflow_summarizes_oldest_ten() {
        let (ctx, summarizer) = context(ContextConfig::default());
        for i in 0..21 {
            ctx.add_message("c1", "user", &format!("msg {}", i));
        }

        // 21 messages: oldest 10 overflowed, 11 remain
        assert_eq!(ctx.buffer_len("c1"), 11);
        assert_eq!(ctx.summarizations_spawned(), 1);

        // Let the spawned task run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.summary("c1").as_deref(), Some("they talked about tests"));

        // The surviving window starts at message 10
        let history = ctx.get_history("c1");
        let first_user = history.iter().find(|m| m.role == "user").unwrap();
        assert_eq!(first_user.text(), "msg 10");
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_window_at_quiescence() {
        let (ctx, _) = context(ContextConfig::default());
        for i in 0..100 {
            ctx.add_message("c1", "user", &format!("m{}", i));
        }
        assert!(ctx.buffer_len("c1") <= 20);
    }

    #[tokio::test]
    async fn test_summary_prefix_in_history() {
        let (ctx, _) = context(ContextConfig::default());
        for i in 0..21 {
            ctx.add_message("c1", "user", &format!("msg {}", i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let history = ctx.get_history("c1");
        assert_eq!(history[0].role, "system");
        assert!(
            history[0]
                .text()
                .starts_with("[Previous conversation context:")
        );
    }

    // ============================================================================
    // Summary merging
    // ============================================================================

    #[tokio::test]
    async fn test_summaries_merge_with_then() {
        let (ctx, _) = context(ContextConfig::default());
        for i in 0..21 {
            ctx.add_message("c1", "user", &format!("a{}", i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second overflow
        for i in 0..10 {
            ctx.add_message("c1", "user", &format!("b{}", i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let summary = ctx.summary("c1").unwrap();
        assert_eq!(
            summary,
            "they talked about tests Then: they talked about tests"
        );
    }

    #[test]
    fn test_keep_suffix() {
        assert_eq!(keep_suffix("abcdef", 3), "def");
        assert_eq!(keep_suffix("ab", 10), "ab");
    }

    #[test]
    fn test_cap_bytes_char_boundary() {
        let s = "ééééé"; // 2 bytes per char
        let capped = cap_bytes(s, 5);
        assert_eq!(capped, "éé");
    }

    // ============================================================================
    // Resume detection
    // ============================================================================

    #[tokio::test]
    async fn test_resume_marker_after_idle_gap() {
        let mut config = ContextConfig::default();
        config.idle_timeout = Duration::from_millis(30);
        // Keep eviction out of the way
        config.scan_interval = Duration::from_secs(3600);
        let (ctx, _) = context(config);

        for i in 0..21 {
            ctx.add_message("c1", "user", &format!("m{}", i));
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        ctx.add_message("c1", "user", "back again");

        let history = ctx.get_history("c1");
        assert!(
            history[0]
                .text()
                .contains("resuming after a break"),
            "expected resume marker, got: {}",
            history[0].text()
        );

        // Resuming clears after one fetch
        let history = ctx.get_history("c1");
        assert!(history[0].text().starts_with("[Previous conversation context:"));
    }

    #[tokio::test]
    async fn test_idle_messages_filtered_from_history() {
        let mut config = ContextConfig::default();
        config.idle_timeout = Duration::from_millis(20);
        config.scan_interval = Duration::from_secs(3600);
        let (ctx, _) = context(config);

        ctx.add_message("c1", "user", "stale");
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.add_message("c1", "user", "fresh");

        let history = ctx.get_history("c1");
        let texts: Vec<_> = history.iter().map(|m| m.text()).collect();
        assert!(texts.contains(&"fresh".to_string()));
        assert!(!texts.contains(&"stale".to_string()));
    }

    // ============================================================================
    // Eviction
    // ============================================================================

    #[tokio::test]
    async fn test_eviction_archives_summary() {
        let mut config = ContextConfig::default();
        config.idle_timeout = Duration::from_millis(10);
        config.scan_interval = Duration::from_millis(0);
        let summarizer = FakeSummarizer::new("old talk");
        let memory = Arc::new(RecordingMemory {
            archived: StdMutex::new(Vec::new()),
        });
        let ctx = ConvContext::new(config, summarizer, memory.clone());

        for i in 0..21 {
            ctx.add_message("gone", "user", &format!("m{}", i));
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Touch another channel to trigger the scan
        ctx.add_message("alive", "user", "ping");
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(ctx.buffer_len("gone"), 0);
        let archived = memory.archived.lock().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].category, "episode");
        assert_eq!(archived[0].source, "bridge-summary");
        assert!(archived[0].text.starts_with("Bridge conversation (gone):"));
        assert!((archived[0].importance - 0.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_content_capped_at_32k() {
        let (ctx, _) = context(ContextConfig::default());
        let huge = "x".repeat(64 * 1024);
        ctx.add_message("c1", "user", &huge);
        let history = ctx.get_history("c1");
        assert_eq!(history[0].text().len(), 32 * 1024);
    }
}
