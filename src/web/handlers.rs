// src/web/handlers.rs
// REST handlers: health, level control, models, audit, events, admin

use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use crate::access::AccessLevel;
use crate::error::GatewayError;
use crate::llm::provider::Provider;
use crate::store::AgentConfig;
use crate::web::auth::AuthContext;
use crate::web::guard::decode_path_id;
use crate::web::pairing::read_json;
use crate::web::state::AppState;

/// GET / and /health. Unauthenticated callers get the bare service
/// descriptor; network identity fields appear only with a resolved
/// principal.
pub async fn health(State(state): State<AppState>, request: Request) -> Json<serde_json::Value> {
    let mut body = json!({
        "status": "ok",
        "service": crate::SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    });

    let authenticated = request
        .extensions()
        .get::<AuthContext>()
        .map(|a| a.principal.is_some())
        .unwrap_or(false);
    if authenticated {
        if let Some(ref hostname) = state.config.trusted_hostname {
            body["tailscaleHostname"] = json!(hostname);
        }
        if let Some(ref ip) = state.config.trusted_ip {
            body["tailscaleIP"] = json!(ip);
        }
    }
    Json(body)
}

/// GET /level - boolean only; the numeric level is never revealed here
pub async fn level(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "active": state.gateway_active() }))
}

#[derive(Debug, Deserialize)]
pub struct SetLevelRequest {
    pub level: u8,
}

/// POST /control/level (FULL)
pub async fn set_level(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let body: SetLevelRequest = read_json(request, state.config.max_request_bytes).await?;
    let level = AccessLevel::from_u8(body.level)
        .ok_or_else(|| GatewayError::Parse(format!("invalid level {}", body.level)))?;

    state.set_global_level(level);
    state.events.publish(
        "system.gateway.level",
        HashMap::from([("level".to_string(), level.as_u8().to_string())]),
        "control",
    );
    Ok(Json(json!({
        "status": "ok",
        "level": level.as_u8(),
        "name": level.name(),
    })))
}

/// GET /v1/models (CHAT) - local models plus cloud models with keys
pub async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut data = Vec::new();
    let mut providers: Vec<Provider> = state.providers.available_providers();
    providers.sort_by_key(|p| p.to_string());
    for provider in providers {
        data.push(json!({
            "id": provider.default_model(),
            "object": "model",
            "owned_by": provider.to_string(),
        }));
    }
    Json(json!({ "object": "list", "data": data }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
}

fn default_page_limit() -> usize {
    100
}

/// GET /audit/log (READ) - read-only paginated audit trail
pub async fn audit_log(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<serde_json::Value> {
    let limit = page.limit.min(500);
    let entries = state.audit.page(page.offset, limit);
    Json(json!({
        "total": state.audit.len(),
        "offset": page.offset,
        "entries": entries,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// GET /v1/events (READ) - live SSE subscription with glob filtering
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe(&query.pattern);
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    )
}

// ============================================================================
// Agent administration
// ============================================================================

/// GET /v1/agents (READ)
pub async fn list_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "agents": state.agents.list() }))
}

/// GET /v1/agents/{id} (READ)
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentConfig>, GatewayError> {
    let id = decode_path_id(&id)?;
    state
        .agents
        .get(&id)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound(format!("agent '{}'", id)))
}

/// PUT /v1/agents/{id} (WRITE) - level silently capped at the ceiling
pub async fn put_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<AgentConfig>, GatewayError> {
    let id = decode_path_id(&id)?;
    let mut config: AgentConfig = read_json(request, state.config.max_request_bytes).await?;
    config.id = id;
    let stored = state.agents.upsert(config, state.global_level());
    Ok(Json(stored))
}

/// DELETE /v1/agents/{id} (FULL)
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let id = decode_path_id(&id)?;
    Ok(Json(json!({ "removed": state.agents.remove(&id) })))
}

// ============================================================================
// Device administration
// ============================================================================

/// GET /v1/devices (READ) - tokens are never echoed back
pub async fn list_devices(State(state): State<AppState>) -> Json<serde_json::Value> {
    let devices: Vec<serde_json::Value> = state
        .devices
        .list()
        .into_iter()
        .map(|d| {
            json!({
                "id": d.id,
                "name": d.name,
                "pairedAt": d.paired_at,
                "lastSeen": d.last_seen,
            })
        })
        .collect();
    Json(json!({ "devices": devices }))
}

/// DELETE /v1/devices/{id} (FULL)
pub async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let id = decode_path_id(&id)?;
    Ok(Json(json!({ "removed": state.devices.remove(&id) })))
}

// ============================================================================
// Shell execution
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ShellRequest {
    pub command: String,
}

/// POST /exec/shell (FULL) - allowed commands only, sandbox cwd
pub async fn exec_shell(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, GatewayError> {
    let level = request
        .extensions()
        .get::<AuthContext>()
        .map(|a| a.effective_level)
        .unwrap_or(AccessLevel::Off);
    let body: ShellRequest = read_json(request, state.config.max_request_bytes).await?;

    let arguments = json!({ "command": body.command }).to_string();
    match state.tools.execute("shell", &arguments, level).await {
        Ok(output) => {
            let parsed: serde_json::Value =
                serde_json::from_str(&output).unwrap_or_else(|_| json!({ "output": output }));
            Ok(Json(parsed).into_response())
        }
        Err(error) => Err(GatewayError::Forbidden(error)),
    }
}
