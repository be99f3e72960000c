// src/chat/completions.rs
// POST /v1/chat/completions: streaming and non-streaming dispatch

use axum::Json;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chat::pipeline::{PreparedChat, post_response, prepare};
use crate::chat::tool_loop::run_tool_loop;
use crate::error::GatewayError;
use crate::llm::http_client::STREAM_TIMEOUT;
use crate::llm::types::{ChatCompletionChunk, ChatCompletionRequest};
use crate::web::auth::AuthContext;
use crate::web::pairing::read_json;
use crate::web::state::AppState;

/// Message surfaced in-band when an upstream stream dies after headers
const STREAM_INTERRUPTED: &str = "[Stream interrupted — please try again]";
/// Chunk buffer between the pump task and the SSE writer
const STREAM_BUFFER: usize = 64;

/// Chat-completion entry point
pub async fn chat_completions(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, GatewayError> {
    let auth = request
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or(GatewayError::Auth)?;
    let body: ChatCompletionRequest = read_json(request, state.config.max_request_bytes).await?;
    if body.messages.is_empty() {
        return Err(GatewayError::Parse("messages must not be empty".into()));
    }

    let streaming = body.wants_stream();
    let prepared = prepare(&state, &auth, body).await;

    if streaming {
        Ok(stream_response(state, auth, prepared))
    } else {
        non_streaming(state, auth, prepared).await
    }
}

/// Non-streaming: run the tool loop, return the final OpenAI JSON
async fn non_streaming(
    state: AppState,
    auth: AuthContext,
    prepared: PreparedChat,
) -> Result<Response, GatewayError> {
    let user_text = prepared.request.last_user_text().unwrap_or_default();
    let result = run_tool_loop(
        &state.providers,
        &state.tools,
        auth.effective_level,
        prepared.request,
        &prepared.model,
        prepared.client_supplied_tools,
        None,
    )
    .await?;

    if !result.returned_to_client {
        post_response(
            &state,
            &auth,
            &prepared.model,
            &user_text,
            &result.response.text(),
            result.response.usage.as_ref(),
        );
    }
    Ok(Json(result.response).into_response())
}

/// Streaming dispatch: synthesized SSE over the tool loop when the
/// gateway manages tools, translated provider stream otherwise. Errors
/// after headers only ever appear as an in-band content chunk followed
/// by finish and [DONE].
fn stream_response(state: AppState, auth: AuthContext, prepared: PreparedChat) -> Response {
    let (tx, mut rx) = mpsc::channel::<ChatCompletionChunk>(STREAM_BUFFER);
    let model = prepared.model.clone();

    if prepared.gateway_tools {
        tokio::spawn(run_synthesized_stream(state, auth, prepared, tx));
    } else {
        tokio::spawn(run_passthrough_stream(state, auth, prepared, tx));
    }

    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            let data = serde_json::to_string(&chunk).unwrap_or_default();
            yield Ok::<_, std::convert::Infallible>(Event::default().data(data));
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)))
        .into_response();
    response
        .headers_mut()
        .insert("Cache-Control", HeaderValue::from_static("no-cache"));
    info!(model = %model, "SSE stream opened");
    response
}

/// Gateway-managed tools cannot stream token-by-token: the tool loop
/// runs on non-streaming calls and the stream carries progress strings
/// plus exactly one final content chunk with the full answer.
async fn run_synthesized_stream(
    state: AppState,
    auth: AuthContext,
    prepared: PreparedChat,
    tx: mpsc::Sender<ChatCompletionChunk>,
) {
    let user_text = prepared.request.last_user_text().unwrap_or_default();
    let model = prepared.model.clone();

    let outcome = tokio::time::timeout(
        STREAM_TIMEOUT,
        run_tool_loop(
            &state.providers,
            &state.tools,
            auth.effective_level,
            prepared.request,
            &model,
            false,
            Some(tx.clone()),
        ),
    )
    .await;

    match outcome {
        Ok(Ok(result)) => {
            let text = result.response.text();
            if !text.is_empty() {
                let _ = tx.send(ChatCompletionChunk::content(&model, text.clone())).await;
            }
            let _ = tx.send(ChatCompletionChunk::finish(&model, "stop")).await;
            post_response(
                &state,
                &auth,
                &model,
                &user_text,
                &text,
                result.response.usage.as_ref(),
            );
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Tool-loop stream failed, surfacing in-band");
            send_interrupted(&tx, &model).await;
        }
        Err(_) => {
            warn!("Tool-loop stream hit the wall-clock ceiling");
            send_interrupted(&tx, &model).await;
        }
    }
}

/// No gateway tools: open a provider stream and forward translated
/// chunks, accumulating text for the conversation log.
async fn run_passthrough_stream(
    state: AppState,
    auth: AuthContext,
    prepared: PreparedChat,
    tx: mpsc::Sender<ChatCompletionChunk>,
) {
    let user_text = prepared.request.last_user_text().unwrap_or_default();
    let model = prepared.model.clone();

    let (provider_tx, mut provider_rx) = mpsc::channel::<ChatCompletionChunk>(STREAM_BUFFER);
    let providers = state.providers.clone();
    let request = prepared.request;
    let provider_model = model.clone();
    let provider_task = tokio::spawn(async move {
        providers.stream(&request, &provider_model, provider_tx).await
    });

    let mut assistant_text = String::new();
    let mut saw_finish = false;
    let mut client_gone = false;

    let deadline = tokio::time::sleep(STREAM_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            maybe = provider_rx.recv() => {
                let Some(chunk) = maybe else { break };
                if let Some(choice) = chunk.choices.first() {
                    if let Some(ref content) = choice.delta.content {
                        assistant_text.push_str(content);
                    }
                    if choice.finish_reason.is_some() {
                        saw_finish = true;
                    }
                }
                if tx.send(chunk).await.is_err() {
                    // Client disconnected: dropping the receiver cancels
                    // the provider read
                    client_gone = true;
                    break;
                }
            }
            _ = &mut deadline => {
                // The streaming client has no total request timeout; the
                // wall clock is enforced here
                warn!(model = %model, "Stream exceeded wall-clock ceiling");
                provider_task.abort();
                break;
            }
        }
    }
    drop(provider_rx);

    if client_gone {
        provider_task.abort();
        return;
    }

    let provider_result = match provider_task.await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::Upstream(format!("stream task failed: {}", e))),
    };

    if provider_result.is_err() || !saw_finish {
        if let Err(ref e) = provider_result {
            warn!(error = %e, "Provider stream interrupted, surfacing in-band");
        }
        send_interrupted(&tx, &model).await;
    }

    if !assistant_text.is_empty() {
        post_response(&state, &auth, &model, &user_text, &assistant_text, None);
    }
}

/// In-band failure: content chunk with a user-visible message, then a
/// finish chunk. The SSE writer appends [DONE] when the channel closes.
async fn send_interrupted(tx: &mpsc::Sender<ChatCompletionChunk>, model: &str) {
    let _ = tx
        .send(ChatCompletionChunk::content(model, STREAM_INTERRUPTED))
        .await;
    let _ = tx.send(ChatCompletionChunk::finish(model, "stop")).await;
}
