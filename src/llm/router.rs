// src/llm/router.rs
// Provider dispatch: model resolution, fallback chain, error surfacing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Secrets;
use crate::error::GatewayError;
use crate::llm::anthropic::AnthropicClient;
use crate::llm::gemini::GeminiClient;
use crate::llm::http_client::LlmHttpError;
use crate::llm::openai_compat::OpenAiCompatClient;
use crate::llm::provider::Provider;
use crate::llm::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

/// One backend the router can dispatch to. All implementations accept
/// and yield OpenAI-shaped payloads.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Non-streaming completion
    async fn complete(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, LlmHttpError>;

    /// Streaming completion; OpenAI chunks are sent to `tx`. A dropped
    /// receiver cancels the stream without error.
    async fn stream(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<(), LlmHttpError>;
}

/// Routes requests to providers by model prefix, with retry handled per
/// client and fallback handled here.
pub struct ProviderRouter {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
    local_default_model: String,
}

impl ProviderRouter {
    /// Build clients for every provider with a configured key; the local
    /// runner is always available.
    pub fn from_secrets(secrets: &Secrets, local_default_model: String) -> Self {
        let mut clients: HashMap<Provider, Arc<dyn ProviderClient>> = HashMap::new();

        if let Some(ref key) = secrets.anthropic {
            clients.insert(
                Provider::Anthropic,
                Arc::new(AnthropicClient::new(key.clone())),
            );
        }
        if let Some(ref key) = secrets.openai {
            clients.insert(
                Provider::OpenAi,
                Arc::new(OpenAiCompatClient::openai(key.clone())),
            );
        }
        if let Some(ref key) = secrets.gemini {
            clients.insert(Provider::Gemini, Arc::new(GeminiClient::new(key.clone())));
        }
        if let Some(ref key) = secrets.xai {
            clients.insert(Provider::XAi, Arc::new(OpenAiCompatClient::xai(key.clone())));
        }
        clients.insert(
            Provider::Local,
            Arc::new(OpenAiCompatClient::local(secrets.local_base_url.clone())),
        );

        let available: Vec<_> = clients.keys().map(|p| p.to_string()).collect();
        info!(providers = ?available, "LLM providers available");

        Self {
            clients,
            local_default_model,
        }
    }

    /// Explicit client set, used by tests and embedders
    pub fn with_clients(
        clients: Vec<Arc<dyn ProviderClient>>,
        local_default_model: String,
    ) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.provider(), c)).collect(),
            local_default_model,
        }
    }

    /// Resolve the model for a request: explicit body field wins, then
    /// the agent's preferred model, then the local default.
    pub fn resolve_model(&self, requested: Option<&str>, agent_preferred: Option<&str>) -> String {
        requested
            .filter(|m| !m.trim().is_empty())
            .or(agent_preferred.filter(|m| !m.trim().is_empty()))
            .map(String::from)
            .unwrap_or_else(|| self.local_default_model.clone())
    }

    pub fn is_available(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }

    pub fn available_providers(&self) -> Vec<Provider> {
        self.clients.keys().copied().collect()
    }

    /// Model used when `provider` is reached through fallback
    fn fallback_model(&self, provider: Provider) -> String {
        match provider {
            Provider::Local => self.local_default_model.clone(),
            other => other.default_model().to_string(),
        }
    }

    /// Providers to try, primary first, then the declared fallback order
    fn dispatch_order(&self, primary: Provider) -> Vec<Provider> {
        let mut order = vec![primary];
        order.extend(
            Provider::fallback_order()
                .iter()
                .copied()
                .filter(|p| *p != primary),
        );
        order
    }

    /// Non-streaming completion with retry (inside each client) and
    /// fallback (here). Provider auth failures surface immediately and
    /// are never retried or fallen back.
    pub async fn complete(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let primary = Provider::from_model(model);
        let mut last_error: Option<LlmHttpError> = None;

        for (i, provider) in self.dispatch_order(primary).into_iter().enumerate() {
            let Some(client) = self.clients.get(&provider) else {
                continue;
            };
            let use_model = if i == 0 {
                model.to_string()
            } else {
                self.fallback_model(provider)
            };

            match client.complete(req, &use_model).await {
                Ok(response) => {
                    if i > 0 {
                        info!(primary = %primary, fallback = %provider, "Request served by fallback provider");
                    }
                    return Ok(response);
                }
                Err(LlmHttpError::AuthRejected { status }) => {
                    return Err(GatewayError::UpstreamAuth { status });
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(GatewayError::Upstream(e.to_string())),
            None => Err(GatewayError::ConfigMissing(format!(
                "{} (set {})",
                primary,
                primary.api_key_env_var()
            ))),
        }
    }

    /// Streaming completion. Fallback applies only while no chunk has
    /// been forwarded; once a provider starts producing, its errors are
    /// surfaced to the caller for in-band recovery.
    pub async fn stream(
        &self,
        req: &ChatCompletionRequest,
        model: &str,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<(), GatewayError> {
        let primary = Provider::from_model(model);
        let mut last_error: Option<LlmHttpError> = None;

        for (i, provider) in self.dispatch_order(primary).into_iter().enumerate() {
            let Some(client) = self.clients.get(&provider) else {
                continue;
            };
            let use_model = if i == 0 {
                model.to_string()
            } else {
                self.fallback_model(provider)
            };

            // Intermediate channel so we know whether this provider got
            // any chunks out before failing. The receiver moves into the
            // forward task so a caller disconnect propagates backwards.
            let (provider_tx, mut provider_rx) = mpsc::channel::<ChatCompletionChunk>(64);
            let caller_tx = tx.clone();
            let forward = async move {
                let mut forwarded = 0usize;
                while let Some(chunk) = provider_rx.recv().await {
                    forwarded += 1;
                    if caller_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                forwarded
            };

            let (result, forwarded) = tokio::join!(client.stream(req, &use_model, provider_tx), forward);
            match result {
                Ok(()) => return Ok(()),
                Err(LlmHttpError::AuthRejected { status }) => {
                    return Err(GatewayError::UpstreamAuth { status });
                }
                Err(e) if forwarded > 0 => {
                    // Mid-stream death: no fallback, surface for in-band recovery
                    return Err(GatewayError::Upstream(e.to_string()));
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Stream connect failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(GatewayError::Upstream(e.to_string())),
            None => Err(GatewayError::ConfigMissing(format!(
                "{} (set {})",
                primary,
                primary.api_key_env_var()
            ))),
        }
    }
}
