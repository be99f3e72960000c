// src/web/pairing.rs
// Device pairing handshake and trusted-network auto-pair

use axum::Json;
use axum::extract::{Request, State};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::web::auth::AuthContext;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PairRequest {
    pub code: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
}

#[derive(Debug, Serialize)]
pub struct PairResponse {
    pub token: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

/// POST /pair - code-based pairing handshake
pub async fn pair(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<PairResponse>, GatewayError> {
    let client_ip = client_ip(&request);
    let body: PairRequest = read_json(request, state.config.max_request_bytes).await?;

    if !state.pairing.verify_and_rotate(body.code.trim()) {
        warn!(ip = %client_ip, "Pairing attempt with wrong code");
        state.events.publish(
            "security.pairing.rejected",
            HashMap::from([("ip".to_string(), client_ip)]),
            "pairing",
        );
        return Err(GatewayError::Forbidden("invalid pairing code".into()));
    }

    let device = state.devices.pair(&body.device_name);
    state.events.publish(
        "system.device.paired",
        HashMap::from([("device".to_string(), device.id.clone())]),
        "pairing",
    );
    Ok(Json(PairResponse {
        token: device.token,
        device_id: device.id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

/// POST /pair/verify - token validity probe
pub async fn verify(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let body: VerifyRequest = read_json(request, state.config.max_request_bytes).await?;
    Ok(Json(json!({ "valid": state.devices.verify(&body.token) })))
}

#[derive(Debug, Deserialize)]
pub struct AutoPairRequest {
    #[serde(rename = "deviceName")]
    pub device_name: String,
}

/// POST /pair/auto - tokenless pairing from the trusted network,
/// idempotent per device name.
pub async fn auto_pair(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let client_ip = client_ip(&request);
    let in_trusted_network = client_ip
        .parse::<IpAddr>()
        .map(|ip| state.config.trusted_network.contains(&ip))
        .unwrap_or(false);
    if !in_trusted_network {
        warn!(ip = %client_ip, "Auto-pair attempt from outside the trusted network");
        return Err(GatewayError::Forbidden(
            "auto-pairing requires the trusted network".into(),
        ));
    }

    let body: AutoPairRequest = read_json(request, state.config.max_request_bytes).await?;
    let (device, existed) = state.devices.pair_auto(&body.device_name);
    info!(device = %device.id, existed, "Trusted-network auto-pair");
    Ok(Json(json!({
        "token": device.token,
        "deviceId": device.id,
        "status": if existed { "existing" } else { "new" },
    })))
}

/// POST /chat/session - mint a CHAT-scoped webchat session token
pub async fn new_session(State(state): State<AppState>) -> Json<serde_json::Value> {
    let token = state.sessions.mint();
    Json(json!({ "token": token }))
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<AuthContext>()
        .map(|a| a.client_ip.clone())
        .unwrap_or_else(|| "unknown".into())
}

/// Read and parse a JSON body, bounded by the configured request cap.
/// Failures map to the Parse kind with a redacted log preview.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    request: Request,
    limit: usize,
) -> Result<T, GatewayError> {
    let bytes = axum::body::to_bytes(request.into_body(), limit)
        .await
        .map_err(|_| GatewayError::Parse("unreadable or oversized body".into()))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        let preview: String = String::from_utf8_lossy(&bytes).chars().take(80).collect();
        warn!(error = %e, preview = %preview, "Malformed JSON body");
        GatewayError::Parse("malformed JSON body".into())
    })
}
