// src/chat/memory.rs
// Contracts for the memory and commitments collaborators
//
// The gateway only defines what it hands these components and what it
// takes back; storage and retrieval strategy live outside the core.

use async_trait::async_trait;
use tracing::debug;

use crate::access::AccessLevel;
use crate::llm::types::ChatMessage;

/// What the pipeline knows at enrichment time
pub struct EnrichmentContext<'a> {
    pub messages: &'a [ChatMessage],
    pub access_level: AccessLevel,
    pub tool_names: Vec<String>,
    /// The client supplied its own system message; identity injection
    /// is skipped in that case.
    pub client_provided_system: bool,
    pub agent_id: Option<String>,
    pub platform: Option<String>,
}

/// Memory unit archived by the context subsystem on channel eviction
#[derive(Debug, Clone)]
pub struct MemoryArchiveEntry {
    pub text: String,
    pub category: String,
    pub source: String,
    pub importance: f32,
}

/// The memory collaborator. `enrich` may prepend an identity system
/// message and a memory-context block; the pipeline does not interpret
/// what it returns beyond prepending it.
#[async_trait]
pub trait MemoryCollaborator: Send + Sync {
    async fn enrich(&self, ctx: EnrichmentContext<'_>) -> Vec<ChatMessage>;

    /// Fire-and-forget extraction from a completed exchange
    async fn extract(&self, user_text: &str, assistant_text: &str, agent_id: Option<&str>);

    /// Durable archival (channel summaries on eviction)
    async fn archive(&self, entry: MemoryArchiveEntry);
}

/// Default collaborator: injects nothing, remembers nothing
pub struct NoopMemory;

#[async_trait]
impl MemoryCollaborator for NoopMemory {
    async fn enrich(&self, _ctx: EnrichmentContext<'_>) -> Vec<ChatMessage> {
        Vec::new()
    }

    async fn extract(&self, _user_text: &str, _assistant_text: &str, _agent_id: Option<&str>) {}

    async fn archive(&self, entry: MemoryArchiveEntry) {
        debug!(category = %entry.category, source = %entry.source, "Archive discarded (no memory backend)");
    }
}

/// Commitments sniffer: fed the last user message, persists findings
/// independently of the response.
#[async_trait]
pub trait CommitmentsDetector: Send + Sync {
    async fn sniff(&self, text: &str, agent_id: Option<&str>);
}

pub struct NoopCommitments;

#[async_trait]
impl CommitmentsDetector for NoopCommitments {
    async fn sniff(&self, _text: &str, _agent_id: Option<&str>) {}
}
