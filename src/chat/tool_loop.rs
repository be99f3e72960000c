// src/chat/tool_loop.rs
// Bounded server-side tool execution loop

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::access::AccessLevel;
use crate::chat::tools::{ToolRegistry, progress_label};
use crate::error::GatewayError;
use crate::llm::router::ProviderRouter;
use crate::llm::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ToolCall,
    Usage,
};

/// Tool rounds before the loop forces a plain answer
pub const MAX_TOOL_ROUNDS: usize = 5;

/// Outcome of running the loop to completion
pub struct ToolLoopResult {
    pub response: ChatCompletionResponse,
    /// The response carries tool calls the client must complete
    pub returned_to_client: bool,
}

/// Run the bounded tool loop against non-streaming provider calls.
///
/// When the client supplied its own tools, any tool calls in the
/// response are returned as-is for the client to complete. Otherwise
/// server-executable calls run here (concurrently, except tools marked
/// sequential), their results are appended in provider order, and the
/// conversation loops. Hallucinated calls with no text trigger one
/// retry without tools.
pub async fn run_tool_loop(
    providers: &ProviderRouter,
    registry: &ToolRegistry,
    level: AccessLevel,
    mut request: ChatCompletionRequest,
    model: &str,
    client_supplied_tools: bool,
    progress: Option<mpsc::Sender<ChatCompletionChunk>>,
) -> Result<ToolLoopResult, GatewayError> {
    let mut total_usage = Usage::default();
    let mut saw_usage = false;
    let mut retried_without_tools = false;

    for round in 0..MAX_TOOL_ROUNDS {
        let response = providers.complete(&request, model).await?;
        accumulate(&mut total_usage, &mut saw_usage, &response);

        let calls = response.tool_calls().to_vec();
        if calls.is_empty() {
            return Ok(finish(response, total_usage, saw_usage, false));
        }

        // Client-owned tools: the client completes the round
        if client_supplied_tools {
            return Ok(finish(response, total_usage, saw_usage, true));
        }

        let any_executable = calls.iter().any(|c| registry.is_executable(&c.function.name, level));
        if !any_executable {
            if response.text().is_empty() && !retried_without_tools {
                // Hallucinated tools and nothing to say: force a plain answer
                info!(round, "Only unexecutable tool calls, retrying without tools");
                retried_without_tools = true;
                request.tools = None;
                request.tool_choice = None;
                continue;
            }
            return Ok(finish(response, total_usage, saw_usage, false));
        }

        debug!(round, calls = calls.len(), "Executing tool round");

        // The assistant message precedes the tool results that answer it
        let assistant = response
            .message()
            .cloned()
            .unwrap_or_else(|| ChatMessage::assistant_tool_calls(None, calls.clone()));
        request.messages.push(assistant);

        for message in execute_calls(registry, level, &calls, progress.as_ref(), model).await {
            request.messages.push(message);
        }
    }

    // Rounds exhausted: one final call without tools
    info!("Tool rounds exhausted, forcing final answer");
    request.tools = None;
    request.tool_choice = None;
    let response = providers.complete(&request, model).await?;
    accumulate(&mut total_usage, &mut saw_usage, &response);
    Ok(finish(response, total_usage, saw_usage, false))
}

/// Execute one round of calls, returning tool-role messages in the
/// order the provider issued the calls. Sequential tools (file
/// mutation) run in order; the rest run concurrently.
async fn execute_calls(
    registry: &ToolRegistry,
    level: AccessLevel,
    calls: &[ToolCall],
    progress: Option<&mpsc::Sender<ChatCompletionChunk>>,
    model: &str,
) -> Vec<ChatMessage> {
    if let Some(tx) = progress {
        for call in calls {
            let label = progress_label(&call.function.name, &call.function.arguments);
            let _ = tx
                .send(ChatCompletionChunk::content(model, format!("{}\n", label)))
                .await;
        }
    }

    let mut results: Vec<Option<String>> = vec![None; calls.len()];

    // Sequential pass, in provider order
    for (i, call) in calls.iter().enumerate() {
        if registry.is_sequential(&call.function.name) {
            results[i] = Some(run_one(registry, level, call).await);
        }
    }

    // Concurrent pass for the rest
    let concurrent: Vec<(usize, &ToolCall)> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| !registry.is_sequential(&c.function.name))
        .collect();
    let outputs = join_all(
        concurrent
            .iter()
            .map(|&(_, call)| run_one(registry, level, call)),
    )
    .await;
    for ((i, _), output) in concurrent.into_iter().zip(outputs) {
        results[i] = Some(output);
    }

    calls
        .iter()
        .zip(results)
        .map(|(call, output)| {
            ChatMessage::tool_result(call.id.clone(), output.unwrap_or_default())
        })
        .collect()
}

/// Execute one call; errors become payloads the model can read
async fn run_one(registry: &ToolRegistry, level: AccessLevel, call: &ToolCall) -> String {
    match registry
        .execute(&call.function.name, &call.function.arguments, level)
        .await
    {
        Ok(output) => output,
        Err(error) => serde_json::json!({ "error": error }).to_string(),
    }
}

fn accumulate(total: &mut Usage, saw: &mut bool, response: &ChatCompletionResponse) {
    if let Some(ref usage) = response.usage {
        total.prompt_tokens += usage.prompt_tokens;
        total.completion_tokens += usage.completion_tokens;
        total.total_tokens += usage.total_tokens;
        *saw = true;
    }
}

fn finish(
    mut response: ChatCompletionResponse,
    total_usage: Usage,
    saw_usage: bool,
    returned_to_client: bool,
) -> ToolLoopResult {
    if saw_usage {
        response.usage = Some(total_usage);
    }
    ToolLoopResult {
        response,
        returned_to_client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tools::NoopMcpTools;
    use crate::config::{GatewayConfig, SecretStore, Secrets};
    use crate::llm::http_client::LlmHttpError;
    use crate::llm::provider::Provider;
    use crate::llm::router::ProviderClient;
    use crate::llm::types::{FunctionCall, Tool};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Backend that replays a script of responses
    struct ScriptedClient {
        script: Mutex<Vec<ChatCompletionResponse>>,
        seen_requests: Mutex<Vec<ChatCompletionRequest>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<ChatCompletionResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen_requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        fn provider(&self) -> Provider {
            Provider::Local
        }

        async fn complete(
            &self,
            req: &ChatCompletionRequest,
            _model: &str,
        ) -> Result<ChatCompletionResponse, LlmHttpError> {
            self.seen_requests.lock().unwrap().push(req.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(LlmHttpError::Transport("script exhausted".into()));
            }
            Ok(script.remove(0))
        }

        async fn stream(
            &self,
            _req: &ChatCompletionRequest,
            _model: &str,
            _tx: mpsc::Sender<ChatCompletionChunk>,
        ) -> Result<(), LlmHttpError> {
            unimplemented!("non-streaming test client")
        }
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    fn tool_response(calls: Vec<ToolCall>) -> ChatCompletionResponse {
        ChatCompletionResponse::of_message(
            "llama3.2",
            ChatMessage::assistant_tool_calls(None, calls),
            "tool_calls",
        )
    }

    fn text_response(text: &str) -> ChatCompletionResponse {
        ChatCompletionResponse::of_message("llama3.2", ChatMessage::assistant(text), "stop")
    }

    fn fixture(script: Vec<ChatCompletionResponse>) -> (ProviderRouter, ToolRegistry, Arc<ScriptedClient>, tempfile::TempDir) {
        let client = ScriptedClient::new(script);
        let router = ProviderRouter::with_clients(vec![client.clone()], "llama3.2".into());
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(GatewayConfig::with_data_dir(dir.path().to_path_buf()));
        let registry = ToolRegistry::new(
            config,
            SecretStore::new(Secrets::default()),
            Arc::new(NoopMcpTools),
        );
        (router, registry, client, dir)
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: None,
            messages: vec![ChatMessage::user("what time is it?")],
            stream: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    // ============================================================================
    // Loop behavior
    // ============================================================================

    #[tokio::test]
    async fn test_plain_answer_passes_through() {
        let (router, registry, _, _dir) = fixture(vec![text_response("4 o'clock")]);
        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        assert!(!result.returned_to_client);
        assert_eq!(result.response.text(), "4 o'clock");
    }

    #[tokio::test]
    async fn test_executes_tool_then_orders_messages() {
        let (router, registry, client, _dir) = fixture(vec![
            tool_response(vec![tool_call("call_1", "get_time", "{}")]),
            text_response("done"),
        ]);
        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.response.text(), "done");

        // Second provider call saw: user, assistant(tool_calls), tool
        let seen = client.seen_requests.lock().unwrap();
        let roles: Vec<_> = seen[1].messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool"]);
        assert_eq!(
            seen[1].messages[2].tool_call_id.as_deref(),
            Some("call_1")
        );
    }

    #[tokio::test]
    async fn test_client_tools_returned_as_is() {
        let calls = vec![tool_call("call_9", "client_widget", r#"{"a":1}"#)];
        let (router, registry, _, _dir) = fixture(vec![tool_response(calls.clone())]);
        let mut req = request();
        req.tools = Some(vec![Tool::function(
            "client_widget",
            "client-side tool",
            serde_json::json!({"type":"object"}),
        )]);

        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            req,
            "llama3.2",
            true,
            None,
        )
        .await
        .unwrap();
        assert!(result.returned_to_client);
        assert_eq!(result.response.tool_calls(), calls.as_slice());
    }

    #[tokio::test]
    async fn test_hallucinated_tool_retries_once_without_tools() {
        let (router, registry, client, _dir) = fixture(vec![
            tool_response(vec![tool_call("c", "imaginary_tool", "{}")]),
            text_response("plain answer"),
        ]);
        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.response.text(), "plain answer");

        // The retry dropped the tool definitions
        let seen = client.seen_requests.lock().unwrap();
        assert!(seen[1].tools.is_none());
    }

    #[tokio::test]
    async fn test_round_bound_forces_final_answer() {
        // Provider insists on tools every round
        let mut script: Vec<ChatCompletionResponse> = (0..MAX_TOOL_ROUNDS)
            .map(|i| tool_response(vec![tool_call(&format!("c{}", i), "get_time", "{}")]))
            .collect();
        script.push(text_response("forced final"));

        let (router, registry, client, _dir) = fixture(script);
        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.response.text(), "forced final");

        // Final call carried no tool definitions
        let seen = client.seen_requests.lock().unwrap();
        assert_eq!(seen.len(), MAX_TOOL_ROUNDS + 1);
        assert!(seen.last().unwrap().tools.is_none());
    }

    #[tokio::test]
    async fn test_collaborator_tool_executes_server_side() {
        use crate::chat::tools::McpToolCollaborator;
        use crate::llm::types::Tool;

        struct FakeMcp;

        #[async_trait]
        impl McpToolCollaborator for FakeMcp {
            fn tools(&self, _level: AccessLevel) -> Vec<Tool> {
                vec![Tool::function(
                    "calendar_lookup",
                    "Look up calendar entries",
                    serde_json::json!({ "type": "object" }),
                )]
            }

            fn provides(&self, name: &str, _level: AccessLevel) -> bool {
                name == "calendar_lookup"
            }

            async fn execute(&self, _name: &str, _arguments: &str) -> Result<String, String> {
                Ok(r#"{"entries":[]}"#.into())
            }
        }

        let client = ScriptedClient::new(vec![
            tool_response(vec![tool_call("c1", "calendar_lookup", "{}")]),
            text_response("no meetings today"),
        ]);
        let router = ProviderRouter::with_clients(vec![client.clone()], "llama3.2".into());
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(GatewayConfig::with_data_dir(dir.path().to_path_buf()));
        let registry = ToolRegistry::new(
            config,
            SecretStore::new(Secrets::default()),
            Arc::new(FakeMcp),
        );

        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        // The collaborator call ran here instead of going back to the client
        assert!(!result.returned_to_client);
        assert_eq!(result.response.text(), "no meetings today");

        let seen = client.seen_requests.lock().unwrap();
        assert_eq!(seen[1].messages[2].text(), r#"{"entries":[]}"#);
    }

    #[tokio::test]
    async fn test_tool_error_reported_not_fatal() {
        let (router, registry, client, _dir) = fixture(vec![
            tool_response(vec![tool_call("c1", "read_file", r#"{"path":"missing.txt"}"#)]),
            text_response("recovered"),
        ]);
        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.response.text(), "recovered");

        let seen = client.seen_requests.lock().unwrap();
        let tool_msg = &seen[1].messages[2];
        assert_eq!(tool_msg.role, "tool");
        assert!(tool_msg.text().contains("error"));
    }

    #[tokio::test]
    async fn test_progress_chunks_emitted() {
        let (router, registry, _, _dir) = fixture(vec![
            tool_response(vec![tool_call("c1", "get_time", "{}")]),
            text_response("done"),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            Some(tx),
        )
        .await
        .unwrap();

        let chunk = rx.recv().await.unwrap();
        assert!(
            chunk.choices[0]
                .delta
                .content
                .as_deref()
                .unwrap()
                .contains("[checking time]")
        );
    }

    #[tokio::test]
    async fn test_usage_accumulates_across_rounds() {
        let mut first = tool_response(vec![tool_call("c1", "get_time", "{}")]);
        first.usage = Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        let mut second = text_response("done");
        second.usage = Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 7,
            total_tokens: 27,
        });

        let (router, registry, _, _dir) = fixture(vec![first, second]);
        let result = run_tool_loop(
            &router,
            &registry,
            AccessLevel::Full,
            request(),
            "llama3.2",
            false,
            None,
        )
        .await
        .unwrap();
        let usage = result.response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 30);
        assert_eq!(usage.completion_tokens, 12);
        assert_eq!(usage.total_tokens, 42);
    }
}
