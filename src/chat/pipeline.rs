// src/chat/pipeline.rs
// Chat-completion pipeline: model resolution, enrichment, post-response

use std::collections::HashMap;
use tracing::debug;

use crate::chat::memory::EnrichmentContext;
use crate::llm::types::{ChatCompletionRequest, ChatMessage, Usage, estimate_tokens};
use crate::store::AgentConfig;
use crate::web::auth::AuthContext;
use crate::web::state::AppState;

/// A request after enrichment and tool injection, ready for dispatch
pub struct PreparedChat {
    pub request: ChatCompletionRequest,
    pub model: String,
    /// Client brought its own tools: calls go back to it unexecuted
    pub client_supplied_tools: bool,
    /// The gateway injected its own tool set (drives SSE synthesis)
    pub gateway_tools: bool,
    pub agent: Option<AgentConfig>,
}

/// Stages 1-5: resolve the model, enrich the message list, inject
/// tools, fire the commitments sniff, log the user message.
pub async fn prepare(
    state: &AppState,
    auth: &AuthContext,
    mut request: ChatCompletionRequest,
) -> PreparedChat {
    let agent = auth.agent_id.as_deref().and_then(|id| state.agents.get(id));

    // Stage 1: explicit model > agent preference > local default
    let model = state.providers.resolve_model(
        request.model.as_deref(),
        agent.as_ref().and_then(|a| a.preferred_model.as_deref()),
    );

    // Stage 2: enrichment. A client-supplied system message suppresses
    // identity injection entirely.
    let client_provided_system = request.has_client_system();
    let mut prefix: Vec<ChatMessage> = Vec::new();
    if !client_provided_system {
        if let Some(ref prompt) = state.config.system_prompt {
            prefix.push(ChatMessage::system(prompt.clone()));
        }
        if let Some(ref agent) = agent {
            prefix.push(ChatMessage::system(agent.identity_block()));
        }
    }

    // Stage 3: tool injection. The gateway set is composed from the
    // effective capability level plus registered MCP collaborator tools.
    let client_supplied_tools = request.tools.is_some();
    let mut gateway_tools = false;
    if client_supplied_tools {
        if request.tool_choice.is_none() {
            request.tool_choice = Some(serde_json::json!("auto"));
        }
    } else {
        let definitions = state.tools.definitions_for_level(auth.effective_level);
        if !definitions.is_empty() {
            request.tools = Some(definitions);
            request.tool_choice = Some(serde_json::json!("auto"));
            gateway_tools = true;
        }
    }

    // Memory enrichment sees the final tool names and the original list
    let tool_names = request
        .tools
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|t| t.function.name.clone())
        .collect();
    let memory_messages = state
        .memory
        .enrich(EnrichmentContext {
            messages: &request.messages,
            access_level: auth.effective_level,
            tool_names,
            client_provided_system,
            agent_id: auth.agent_id.clone(),
            platform: auth.platform.clone(),
        })
        .await;
    prefix.extend(memory_messages);

    if !prefix.is_empty() {
        prefix.append(&mut request.messages);
        request.messages = prefix;
    }

    // Stage 4: commitments sniff, fire-and-forget
    if let Some(last_user) = request.last_user_text() {
        let commitments = state.commitments.clone();
        let agent_id = auth.agent_id.clone();
        tokio::spawn(async move {
            commitments.sniff(&last_user, agent_id.as_deref()).await;
        });
    }

    // Stage 5: user message logging (multi-part content kept intact)
    if let Some(last_user) = request.messages.iter().rev().find(|m| m.role == "user") {
        let content = serde_json::to_value(&last_user.content).unwrap_or_default();
        state.conversation.log(
            "user",
            content,
            Some(&model),
            &auth.client_ip,
            auth.agent_id.as_deref(),
        );
    }

    debug!(
        model = %model,
        gateway_tools,
        client_supplied_tools,
        messages = request.messages.len(),
        "Chat request prepared"
    );

    PreparedChat {
        request,
        model,
        client_supplied_tools,
        gateway_tools,
        agent,
    }
}

/// Stage 7: record the assistant message, update token counters (exact
/// when the provider reported usage, chars/4 otherwise), notify
/// collaborators, and hand the exchange to the memory extractor.
pub fn post_response(
    state: &AppState,
    auth: &AuthContext,
    model: &str,
    user_text: &str,
    assistant_text: &str,
    usage: Option<&Usage>,
) {
    state.conversation.log(
        "assistant",
        serde_json::Value::String(assistant_text.to_string()),
        Some(model),
        &auth.client_ip,
        auth.agent_id.as_deref(),
    );

    match usage {
        Some(u) => state
            .conversation
            .add_usage(u.prompt_tokens as u64, u.completion_tokens as u64),
        None => state.conversation.add_usage(
            estimate_tokens(user_text) as u64,
            estimate_tokens(assistant_text) as u64,
        ),
    }

    state.events.publish(
        "system.agent.completed",
        HashMap::from([
            ("model".to_string(), model.to_string()),
            (
                "agent".to_string(),
                auth.agent_id.clone().unwrap_or_default(),
            ),
        ]),
        "chat",
    );

    // Memory extraction is fire-and-forget and owns its data
    let memory = state.memory.clone();
    let user_text = user_text.to_string();
    let assistant_text = assistant_text.to_string();
    let agent_id = auth.agent_id.clone();
    tokio::spawn(async move {
        memory
            .extract(&user_text, &assistant_text, agent_id.as_deref())
            .await;
    });
}
