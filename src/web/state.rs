// src/web/state.rs
// Shared application state wired at startup

use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

use crate::access::AccessLevel;
use crate::chat::memory::{CommitmentsDetector, MemoryCollaborator, NoopCommitments, NoopMemory};
use crate::chat::summarizer::LlmSummarizer;
use crate::chat::tools::{NoopMcpTools, ToolRegistry};
use crate::config::{GatewayConfig, SecretStore, Secrets};
use crate::context::{ContextConfig, ConvContext};
use crate::events::{AuditLog, EventBus};
use crate::llm::router::ProviderRouter;
use crate::store::{AgentStore, ConversationStore, DeviceStore};
use crate::web::rate_limit::RateLimiter;

/// Requests per minute granted to free-tier cloud users
const FREE_TIER_LIMIT_PER_MINUTE: usize = 30;

/// In-memory webchat session tokens: CHAT-scoped, gone at restart
pub struct SessionStore {
    tokens: Mutex<HashSet<String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashSet::new()),
        }
    }

    pub fn mint(&self) -> String {
        use base64::Engine as _;
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        self.tokens
            .lock()
            .expect("session store poisoned")
            .insert(token.clone());
        token
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .expect("session store poisoned")
            .contains(token)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The active pairing code, displayed out-of-band and rotated after
/// every successful pairing.
pub struct PairingState {
    code: Mutex<String>,
}

impl PairingState {
    pub fn new() -> Self {
        let state = Self {
            code: Mutex::new(generate_code()),
        };
        info!(code = %state.current(), "Pairing code ready");
        state
    }

    pub fn current(&self) -> String {
        self.code.lock().expect("pairing state poisoned").clone()
    }

    /// Check a submitted code; rotates on success
    pub fn verify_and_rotate(&self, submitted: &str) -> bool {
        let mut code = self.code.lock().expect("pairing state poisoned");
        if submitted == code.as_str() {
            *code = generate_code();
            true
        } else {
            false
        }
    }
}

impl Default for PairingState {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub secrets: SecretStore,
    /// Global access ceiling, adjustable via /control/level
    pub global_level: Arc<RwLock<AccessLevel>>,
    pub agents: Arc<AgentStore>,
    pub devices: Arc<DeviceStore>,
    pub sessions: Arc<SessionStore>,
    pub pairing: Arc<PairingState>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Independent limiter for the open pairing/session endpoints
    pub pair_limiter: Arc<RateLimiter>,
    /// Per-user budget applied to free-tier cloud users
    pub cloud_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLog>,
    pub events: Arc<EventBus>,
    pub conversation: Arc<ConversationStore>,
    pub context: Arc<ConvContext>,
    pub providers: Arc<ProviderRouter>,
    pub tools: Arc<ToolRegistry>,
    pub memory: Arc<dyn MemoryCollaborator>,
    pub commitments: Arc<dyn CommitmentsDetector>,
}

impl AppState {
    /// Wire the full component graph from configuration
    pub fn new(config: GatewayConfig, secrets: Secrets) -> Self {
        let config = Arc::new(config);
        let secret_store = SecretStore::new(secrets);
        let providers = Arc::new(ProviderRouter::from_secrets(
            &secret_store.snapshot(),
            config.default_model.clone(),
        ));
        let memory: Arc<dyn MemoryCollaborator> = Arc::new(NoopMemory);
        let summarizer = LlmSummarizer::new(providers.clone(), config.summarizer_model.clone());
        let context = ConvContext::new(ContextConfig::default(), summarizer, memory.clone());

        Self {
            global_level: Arc::new(RwLock::new(config.global_level)),
            agents: Arc::new(AgentStore::load(config.data_dir.join("agents.json"))),
            devices: Arc::new(DeviceStore::load(config.data_dir.join("devices.json"))),
            sessions: Arc::new(SessionStore::new()),
            pairing: Arc::new(PairingState::new()),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            pair_limiter: Arc::new(RateLimiter::new(config.pair_rate_limit_per_minute)),
            cloud_limiter: Arc::new(RateLimiter::new(FREE_TIER_LIMIT_PER_MINUTE)),
            audit: Arc::new(AuditLog::new(config.audit_file.clone())),
            events: Arc::new(EventBus::new(Some(
                config.data_dir.join("critical-events.jsonl"),
            ))),
            conversation: Arc::new(ConversationStore::new(
                config.data_dir.join("conversation.jsonl"),
            )),
            tools: Arc::new(ToolRegistry::new(
                config.clone(),
                secret_store.clone(),
                Arc::new(NoopMcpTools),
            )),
            context,
            providers,
            memory,
            commitments: Arc::new(NoopCommitments),
            secrets: secret_store,
            config,
        }
    }

    pub fn global_level(&self) -> AccessLevel {
        *self.global_level.read().expect("global level poisoned")
    }

    /// Set the global ceiling and re-cap every agent beneath it
    pub fn set_global_level(&self, level: AccessLevel) {
        *self.global_level.write().expect("global level poisoned") = level;
        self.agents.cap_all(level);
        info!(level = %level, "Global access level changed");
    }

    pub fn gateway_active(&self) -> bool {
        self.global_level() > AccessLevel::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_store_mint_and_verify() {
        let sessions = SessionStore::new();
        let token = sessions.mint();
        assert!(sessions.contains(&token));
        assert!(!sessions.contains("other"));
    }

    #[test]
    fn test_pairing_code_rotates_on_success() {
        let pairing = PairingState::new();
        let code = pairing.current();
        assert_eq!(code.len(), 6);
        assert!(!pairing.verify_and_rotate("not-it"));
        assert!(pairing.verify_and_rotate(&code));
        // Old code is dead after rotation
        assert!(!pairing.verify_and_rotate(&code));
    }

    #[test]
    fn test_set_global_level_caps_agents() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(
            GatewayConfig::with_data_dir(dir.path().to_path_buf()),
            Secrets::default(),
        );
        state.agents.upsert(
            crate::store::AgentConfig::new("a", "A", AccessLevel::Full),
            state.global_level(),
        );
        state.set_global_level(AccessLevel::Read);
        assert_eq!(state.global_level(), AccessLevel::Read);
        assert_eq!(
            state.agents.get("a").unwrap().access_level,
            AccessLevel::Read
        );
    }
}
