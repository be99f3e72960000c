// src/web/auth.rs
// Authentication middleware: token resolution and effective-level computation

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

use crate::access::AccessLevel;
use crate::error::GatewayError;
use crate::util::net::{is_loopback, normalize_remote_addr};
use crate::web::guard::required_level;
use crate::web::state::AppState;

pub const AGENT_HEADER: &str = "x-torbo-agent-id";
pub const PLATFORM_HEADER: &str = "x-torbo-platform";
pub const LEVEL_HEADER: &str = "x-torbo-access-level";

/// Cloud subscription tier carried by the optional JWT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudTier {
    Free,
    Pro,
}

/// Who the request authenticated as
#[derive(Debug, Clone)]
pub enum Principal {
    Loopback,
    Master,
    Session,
    Device { id: String },
    CloudUser { user_id: String, tier: CloudTier },
}

impl Principal {
    /// Short tag for audit detail; never includes token material
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Master => "master",
            Self::Session => "session",
            Self::Device { .. } => "device",
            Self::CloudUser { .. } => "cloud",
        }
    }
}

/// Per-request authentication outcome, attached as an extension
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Option<Principal>,
    pub client_ip: String,
    /// min(principal cap, agent level, requested header level)
    pub effective_level: AccessLevel,
    pub agent_id: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudClaims {
    sub: String,
    #[serde(default)]
    tier: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Resolve the client's bearer credential in priority order: loopback
/// bypass, master token, webchat session, paired device, cloud JWT.
/// Guarded routes without a resolvable principal get 401; the reason is
/// audited, never returned.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let client_ip = client_ip_of(&request);
    let bearer = bearer_token(request.headers());
    let principal = resolve_principal(&state, &client_ip, bearer.as_deref());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let guarded = required_level(&method, &path);

    if principal.is_none()
        && let Some(required) = guarded
    {
        state.audit.record(
            &client_ip,
            method.as_str(),
            &path,
            required,
            false,
            "unauthenticated",
        );
        state.events.publish(
            "security.auth.failed",
            HashMap::from([("ip".to_string(), client_ip.clone())]),
            "auth",
        );
        return GatewayError::Auth.into_response();
    }

    let agent_id = header_string(request.headers(), AGENT_HEADER);
    let platform = header_string(request.headers(), PLATFORM_HEADER);
    let effective_level = effective_level(&state, principal.as_ref(), request.headers(), agent_id.as_deref());

    debug!(
        ip = %client_ip,
        principal = principal.as_ref().map(|p| p.kind()).unwrap_or("none"),
        level = %effective_level,
        "Request authenticated"
    );

    request.extensions_mut().insert(AuthContext {
        principal,
        client_ip,
        effective_level,
        agent_id,
        platform,
    });
    next.run(request).await
}

/// Normalized client address: ConnectInfo when serving real sockets,
/// loopback otherwise (in-process test harness).
fn client_ip_of(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| normalize_remote_addr(&info.0.to_string()))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|s| !s.is_empty())
}

fn resolve_principal(state: &AppState, client_ip: &str, bearer: Option<&str>) -> Option<Principal> {
    if is_loopback(client_ip) {
        return Some(Principal::Loopback);
    }
    let token = bearer?;

    let secrets = state.secrets.snapshot();
    if let Some(ref master) = secrets.master_token
        && token == master
    {
        return Some(Principal::Master);
    }
    if state.sessions.contains(token) {
        return Some(Principal::Session);
    }
    if let Some(device) = state.devices.authenticate(token) {
        return Some(Principal::Device { id: device.id });
    }
    if let Some(ref secret) = secrets.jwt_secret
        && let Some((user_id, tier)) = verify_cloud_jwt(secret, token)
    {
        return Some(Principal::CloudUser { user_id, tier });
    }
    None
}

fn verify_cloud_jwt(secret: &str, token: &str) -> Option<(String, CloudTier)> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<CloudClaims>(token, &key, &Validation::default()).ok()?;
    let tier = match data.claims.tier.as_deref() {
        Some("pro") => CloudTier::Pro,
        _ => CloudTier::Free,
    };
    Some((data.claims.sub, tier))
}

/// The effective level can only go down from the principal's ceiling:
/// the agent's configured level caps it, and the request header caps it
/// further (never raises).
fn effective_level(
    state: &AppState,
    principal: Option<&Principal>,
    headers: &HeaderMap,
    agent_id: Option<&str>,
) -> AccessLevel {
    let global = state.global_level();
    let mut level = match principal {
        Some(Principal::Loopback | Principal::Master | Principal::Device { .. }) => global,
        Some(Principal::CloudUser { .. }) => global,
        Some(Principal::Session) => AccessLevel::Chat.capped_at(global),
        None => AccessLevel::Off,
    };

    if let Some(id) = agent_id
        && let Some(agent) = state.agents.get(id)
    {
        level = level.capped_at(agent.access_level);
    }

    if let Some(requested) = header_string(headers, LEVEL_HEADER)
        .and_then(|s| s.parse::<u8>().ok())
        .and_then(AccessLevel::from_u8)
    {
        level = level.capped_at(requested);
    }

    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, Secrets};
    use crate::store::AgentConfig;

    fn state_with_master() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(
            GatewayConfig::with_data_dir(dir.path().to_path_buf()),
            Secrets {
                master_token: Some("master-tok".into()),
                jwt_secret: Some("jwt-secret".into()),
                ..Secrets::default()
            },
        );
        (dir, state)
    }

    // ============================================================================
    // Principal resolution order
    // ============================================================================

    #[test]
    fn test_loopback_bypasses_tokens() {
        let (_dir, state) = state_with_master();
        let principal = resolve_principal(&state, "127.0.0.1", None).unwrap();
        assert!(matches!(principal, Principal::Loopback));
        let principal = resolve_principal(&state, "::1", None).unwrap();
        assert!(matches!(principal, Principal::Loopback));
    }

    #[test]
    fn test_master_token_resolves() {
        let (_dir, state) = state_with_master();
        let principal = resolve_principal(&state, "8.8.8.8", Some("master-tok")).unwrap();
        assert!(matches!(principal, Principal::Master));
    }

    #[test]
    fn test_session_token_resolves() {
        let (_dir, state) = state_with_master();
        let token = state.sessions.mint();
        let principal = resolve_principal(&state, "8.8.8.8", Some(&token)).unwrap();
        assert!(matches!(principal, Principal::Session));
    }

    #[test]
    fn test_device_token_resolves_and_touches_last_seen() {
        let (_dir, state) = state_with_master();
        let device = state.devices.pair("laptop");
        let principal = resolve_principal(&state, "8.8.8.8", Some(&device.token)).unwrap();
        assert!(matches!(principal, Principal::Device { .. }));
        let refreshed = state.devices.list().into_iter().next().unwrap();
        assert!(refreshed.last_seen.is_some());
    }

    #[test]
    fn test_cloud_jwt_resolves() {
        let (_dir, state) = state_with_master();
        let claims = serde_json::json!({
            "sub": "user-1",
            "username": "u",
            "tier": "pro",
            "exp": (chrono::Utc::now().timestamp() + 3600) as usize,
            "iat": chrono::Utc::now().timestamp() as usize,
        });
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"jwt-secret"),
        )
        .unwrap();
        let principal = resolve_principal(&state, "8.8.8.8", Some(&token)).unwrap();
        match principal {
            Principal::CloudUser { user_id, tier } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(tier, CloudTier::Pro);
            }
            other => panic!("expected cloud user, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_token_rejected() {
        let (_dir, state) = state_with_master();
        assert!(resolve_principal(&state, "8.8.8.8", Some("bogus")).is_none());
        assert!(resolve_principal(&state, "8.8.8.8", None).is_none());
    }

    // ============================================================================
    // Effective level computation
    // ============================================================================

    fn headers_with_level(level: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LEVEL_HEADER, level.parse().unwrap());
        headers
    }

    #[test]
    fn test_header_caps_down_never_raises() {
        let (_dir, state) = state_with_master();
        state.agents.upsert(
            AgentConfig::new("x", "X", AccessLevel::Write),
            AccessLevel::Full,
        );

        // Header asks for 5 but the agent sits at WRITE: stays WRITE
        let level = effective_level(
            &state,
            Some(&Principal::Master),
            &headers_with_level("5"),
            Some("x"),
        );
        assert_eq!(level, AccessLevel::Write);

        // Header lowers below the agent level
        let level = effective_level(
            &state,
            Some(&Principal::Master),
            &headers_with_level("1"),
            Some("x"),
        );
        assert_eq!(level, AccessLevel::Chat);
    }

    #[test]
    fn test_session_principal_capped_at_chat() {
        let (_dir, state) = state_with_master();
        let level = effective_level(&state, Some(&Principal::Session), &HeaderMap::new(), None);
        assert_eq!(level, AccessLevel::Chat);
    }

    #[test]
    fn test_unknown_agent_header_ignored() {
        let (_dir, state) = state_with_master();
        let level = effective_level(
            &state,
            Some(&Principal::Master),
            &HeaderMap::new(),
            Some("no-such-agent"),
        );
        assert_eq!(level, AccessLevel::Full);
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
