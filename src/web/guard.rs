// src/web/guard.rs
// Access guard: route policy table, level check, tier enforcement, audit

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::access::AccessLevel;
use crate::error::GatewayError;
use crate::web::auth::{AuthContext, CloudTier, Principal};
use crate::web::state::AppState;

/// Routes that skip authentication entirely
const OPEN_PATHS: &[&str] = &[
    "/",
    "/health",
    "/level",
    "/pair",
    "/pair/verify",
    "/pair/auto",
    "/chat/session",
];

/// Open pairing/session endpoints carry their own independent limiter
pub fn uses_pair_limiter(path: &str) -> bool {
    matches!(path, "/pair" | "/pair/verify" | "/pair/auto" | "/chat/session")
}

/// Minimum access level for a route; `None` marks it open (pre-auth).
pub fn required_level(method: &Method, path: &str) -> Option<AccessLevel> {
    if method == Method::OPTIONS || OPEN_PATHS.contains(&path) {
        return None;
    }

    match (method.as_str(), path) {
        ("POST", "/control/level") => Some(AccessLevel::Full),
        ("POST", "/v1/chat/completions") => Some(AccessLevel::Chat),
        ("GET", "/v1/models") => Some(AccessLevel::Chat),
        ("GET", "/audit/log") => Some(AccessLevel::Read),
        ("GET", "/v1/events") => Some(AccessLevel::Read),
        ("GET", "/v1/agents") => Some(AccessLevel::Read),
        ("GET", "/v1/devices") => Some(AccessLevel::Read),
        ("POST", "/exec/shell") => Some(AccessLevel::Full),
        _ => {
            if let Some(rest) = path.strip_prefix("/v1/agents/") {
                if !rest.is_empty() {
                    return match method.as_str() {
                        "GET" => Some(AccessLevel::Read),
                        "PUT" => Some(AccessLevel::Write),
                        "DELETE" => Some(AccessLevel::Full),
                        _ => Some(AccessLevel::Full),
                    };
                }
            }
            if let Some(rest) = path.strip_prefix("/v1/devices/") {
                if !rest.is_empty() && method == Method::DELETE {
                    return Some(AccessLevel::Full);
                }
            }
            // Unknown guarded surface: authentication still required
            Some(AccessLevel::Chat)
        }
    }
}

/// Cloud tier hook outcome
#[derive(Debug, PartialEq)]
enum TierOutcome {
    Allowed,
    Denied,
    RateLimited,
}

/// Map (path, required level, tier) to a plan decision. Free plans stop
/// at READ and get a tighter chat budget; paid plans pass through.
fn enforce_tier(state: &AppState, user_id: &str, required: AccessLevel, tier: CloudTier) -> TierOutcome {
    match tier {
        CloudTier::Pro => TierOutcome::Allowed,
        CloudTier::Free => {
            if required > AccessLevel::Read {
                return TierOutcome::Denied;
            }
            if state
                .cloud_limiter
                .check(&format!("cloud:{}", user_id))
                .is_err()
            {
                return TierOutcome::RateLimited;
            }
            TierOutcome::Allowed
        }
    }
}

/// The access guard: every request that reaches it is audited exactly
/// once, with `granted` matching the authorization outcome.
pub async fn guard_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let auth = request
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .unwrap_or_else(|| AuthContext {
            principal: None,
            client_ip: "unknown".into(),
            effective_level: AccessLevel::Off,
            agent_id: None,
            platform: None,
        });

    let Some(required) = required_level(&method, &path) else {
        // Open route: audited as granted with no level requirement
        state.audit.record(
            &auth.client_ip,
            method.as_str(),
            &path,
            AccessLevel::Off,
            true,
            "open",
        );
        return next.run(request).await;
    };

    // OFF short-circuits everything guarded
    if !state.gateway_active() {
        state.audit.record(
            &auth.client_ip,
            method.as_str(),
            &path,
            required,
            false,
            "gateway off",
        );
        return GatewayError::GatewayOff.into_response();
    }

    // Cloud plan enforcement
    if let Some(Principal::CloudUser { user_id, tier }) = auth.principal.as_ref() {
        match enforce_tier(&state, user_id, required, *tier) {
            TierOutcome::Allowed => {}
            TierOutcome::Denied => {
                state.audit.record(
                    &auth.client_ip,
                    method.as_str(),
                    &path,
                    required,
                    false,
                    "tier denied",
                );
                return GatewayError::TierDenied.into_response();
            }
            TierOutcome::RateLimited => {
                state.audit.record(
                    &auth.client_ip,
                    method.as_str(),
                    &path,
                    required,
                    false,
                    "tier rate limited",
                );
                return GatewayError::RateLimit {
                    retry_after_secs: Some(60),
                }
                .into_response();
            }
        }
    }

    if auth.effective_level < required {
        state.audit.record(
            &auth.client_ip,
            method.as_str(),
            &path,
            required,
            false,
            format!("level {} < required", auth.effective_level.as_u8()),
        );
        return GatewayError::Authorization { required }.into_response();
    }

    state.audit.record(
        &auth.client_ip,
        method.as_str(),
        &path,
        required,
        true,
        auth.principal
            .as_ref()
            .map(|p| p.kind())
            .unwrap_or("none"),
    );
    next.run(request).await
}

/// Percent-decode a dynamic path component and validate it against the
/// identifier allowlist.
pub fn decode_path_id(raw: &str) -> Result<String, GatewayError> {
    let decoded = urlencoding::decode(raw)
        .map_err(|_| GatewayError::Parse("invalid path encoding".into()))?
        .into_owned();
    if decoded.is_empty()
        || !decoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(GatewayError::Parse("invalid identifier".into()));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Route policy table
    // ============================================================================

    #[test]
    fn test_open_routes() {
        assert_eq!(required_level(&Method::GET, "/health"), None);
        assert_eq!(required_level(&Method::GET, "/"), None);
        assert_eq!(required_level(&Method::GET, "/level"), None);
        assert_eq!(required_level(&Method::POST, "/pair"), None);
        assert_eq!(required_level(&Method::OPTIONS, "/v1/chat/completions"), None);
    }

    #[test]
    fn test_core_route_levels() {
        assert_eq!(
            required_level(&Method::POST, "/v1/chat/completions"),
            Some(AccessLevel::Chat)
        );
        assert_eq!(
            required_level(&Method::POST, "/control/level"),
            Some(AccessLevel::Full)
        );
        assert_eq!(
            required_level(&Method::POST, "/exec/shell"),
            Some(AccessLevel::Full)
        );
        assert_eq!(
            required_level(&Method::GET, "/audit/log"),
            Some(AccessLevel::Read)
        );
    }

    #[test]
    fn test_agent_prefix_levels() {
        assert_eq!(
            required_level(&Method::GET, "/v1/agents/helper"),
            Some(AccessLevel::Read)
        );
        assert_eq!(
            required_level(&Method::PUT, "/v1/agents/helper"),
            Some(AccessLevel::Write)
        );
        assert_eq!(
            required_level(&Method::DELETE, "/v1/agents/helper"),
            Some(AccessLevel::Full)
        );
    }

    #[test]
    fn test_unknown_paths_require_auth() {
        assert_eq!(
            required_level(&Method::GET, "/no/such/route"),
            Some(AccessLevel::Chat)
        );
    }

    #[test]
    fn test_pair_limiter_selection() {
        assert!(uses_pair_limiter("/pair"));
        assert!(uses_pair_limiter("/chat/session"));
        assert!(!uses_pair_limiter("/health"));
        assert!(!uses_pair_limiter("/v1/chat/completions"));
    }

    // ============================================================================
    // Path identifier validation
    // ============================================================================

    #[test]
    fn test_decode_path_id_accepts_allowlist() {
        assert_eq!(decode_path_id("agent-1_x").unwrap(), "agent-1_x");
        assert_eq!(decode_path_id("abc%2D2").unwrap(), "abc-2");
    }

    #[test]
    fn test_decode_path_id_rejects_specials() {
        assert!(decode_path_id("..").is_err());
        assert!(decode_path_id("a/b").is_err());
        assert!(decode_path_id("a%2Fb").is_err());
        assert!(decode_path_id("").is_err());
        assert!(decode_path_id("sp ace").is_err());
    }
}
