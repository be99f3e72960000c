// src/config/secrets.rs
// In-memory secret store with read-copy-update semantics

use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Secret material loaded once at startup. Values never appear in logs
/// or response bodies.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    /// Server master token (TORBO_TOKEN)
    pub master_token: Option<String>,
    /// Provider API keys
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub gemini: Option<String>,
    pub xai: Option<String>,
    /// Base URL of the local OpenAI-compatible runner (LOCAL_LLM_URL)
    pub local_base_url: String,
    /// HS256 secret for optional cloud JWTs (JWT_SECRET)
    pub jwt_secret: Option<String>,
    /// Google Custom Search credentials for the web_search tool
    pub search_key: Option<String>,
    pub search_cx: Option<String>,
}

impl Secrets {
    /// Load secrets from environment variables
    pub fn from_env() -> Self {
        let secrets = Self {
            master_token: read_key("TORBO_TOKEN"),
            anthropic: read_key("ANTHROPIC_API_KEY"),
            openai: read_key("OPENAI_API_KEY"),
            gemini: read_key("GEMINI_API_KEY").or_else(|| read_key("GOOGLE_API_KEY")),
            xai: read_key("XAI_API_KEY"),
            local_base_url: read_key("LOCAL_LLM_URL")
                .unwrap_or_else(|| "http://127.0.0.1:11434/v1".to_string()),
            jwt_secret: read_key("JWT_SECRET"),
            search_key: read_key("GOOGLE_SEARCH_KEY"),
            search_cx: read_key("GOOGLE_SEARCH_CX"),
        };
        secrets.log_status();
        secrets
    }

    /// Log which keys are present without exposing values
    fn log_status(&self) {
        let mut available = Vec::new();
        if self.anthropic.is_some() {
            available.push("Anthropic");
        }
        if self.openai.is_some() {
            available.push("OpenAI");
        }
        if self.gemini.is_some() {
            available.push("Gemini");
        }
        if self.xai.is_some() {
            available.push("xAI");
        }
        if available.is_empty() {
            warn!("No cloud provider keys configured - only the local runner is available");
        } else {
            debug!(providers = ?available, "Provider keys loaded");
        }
        if self.master_token.is_none() {
            warn!("TORBO_TOKEN not set - only loopback and paired devices can authenticate");
        }
    }
}

fn read_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

/// Read-copy-update wrapper: readers grab an `Arc` snapshot, writers
/// swap the whole structure. No lock is held across any await.
#[derive(Clone)]
pub struct SecretStore {
    inner: Arc<RwLock<Arc<Secrets>>>,
}

impl SecretStore {
    pub fn new(secrets: Secrets) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(secrets))),
        }
    }

    /// Current snapshot; cheap to clone, safe to hold across awaits
    pub fn snapshot(&self) -> Arc<Secrets> {
        self.inner.read().expect("secret store poisoned").clone()
    }

    /// Replace the whole secret set (key rotation)
    pub fn replace(&self, secrets: Secrets) {
        *self.inner.write().expect("secret store poisoned") = Arc::new(secrets);
    }
}
