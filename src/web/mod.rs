// src/web/mod.rs
// Router assembly: routes, CORS, and the auth/rate/guard middleware spine

pub mod auth;
pub mod guard;
pub mod handlers;
pub mod pairing;
pub mod rate_limit;
pub mod state;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::chat::chat_completions;
use crate::error::GatewayError;
use crate::web::auth::AuthContext;
use crate::web::guard::uses_pair_limiter;
use crate::web::state::AppState;

/// Build the gateway router. Sensitive surfaces (shell execution,
/// level control) are mounted without the CORS layer so browsers can
/// never reach them cross-origin; everything else shares one CORS
/// policy driven by the configured origin allowlist.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state);

    let corsable = Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/level", get(handlers::level))
        .route("/pair", post(pairing::pair))
        .route("/pair/verify", post(pairing::verify))
        .route("/pair/auto", post(pairing::auto_pair))
        .route("/chat/session", post(pairing::new_session))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(handlers::models))
        .route("/audit/log", get(handlers::audit_log))
        .route("/v1/events", get(handlers::events))
        .route("/v1/agents", get(handlers::list_agents))
        .route(
            "/v1/agents/{id}",
            get(handlers::get_agent)
                .put(handlers::put_agent)
                .delete(handlers::delete_agent),
        )
        .route("/v1/devices", get(handlers::list_devices))
        .route("/v1/devices/{id}", delete(handlers::delete_device))
        .layer(cors)
        .layer(middleware::from_fn(preflight_no_content));

    // No CORS headers, ever, on these paths
    let sensitive = Router::new()
        .route("/exec/shell", post(handlers::exec_shell))
        .route("/control/level", post(handlers::set_level));

    Router::new()
        .merge(corsable)
        .merge(sensitive)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            guard::guard_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS policy: echo the Origin only when it passes the validator,
/// allow the custom x-torbo-* headers alongside the standard set.
fn cors_layer(state: &AppState) -> CorsLayer {
    let state = state.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| state.config.origin_allowed(o))
                .unwrap_or(false)
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(auth::AGENT_HEADER),
            header::HeaderName::from_static(auth::PLATFORM_HEADER),
            header::HeaderName::from_static(auth::LEVEL_HEADER),
        ])
}

/// Preflights answer 204 No Content
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

/// Sliding-window rate limiting, after authentication and before the
/// access guard. Pairing endpoints use their own independent limiter;
/// preflights are exempt.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let client_ip = request
        .extensions()
        .get::<AuthContext>()
        .map(|a| a.client_ip.clone())
        .unwrap_or_else(|| "unknown".into());

    let limiter = if uses_pair_limiter(&path) {
        &state.pair_limiter
    } else {
        &state.rate_limiter
    };

    match limiter.check(&client_ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            state.audit.record(
                &client_ip,
                request.method().as_str(),
                &path,
                crate::access::AccessLevel::Off,
                false,
                "rate limited",
            );
            GatewayError::RateLimit {
                retry_after_secs: Some(retry_after_secs),
            }
            .into_response()
        }
    }
}
