//! Auth + rate-limit middleware and the JSON error envelope.
//!
//! Authenticated routes are wrapped with `auth_middleware`, parameterised
//! by the scope the route requires. The middleware extracts the
//! credential, verifies it, checks the per-key windows, attaches the
//! principal to the request, and emits a usage record once the response
//! status is known. Limiter bookkeeping never blocks a permitted
//! request.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::warn;

use super::AppState;
use crate::auth::rate_limit::{RateLimitDecision, RateWindow};
use crate::auth::extract_presented_key;
use crate::types::{JenguError, UsageRecord};

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// A JSON API error: `{error, message, details?}` plus any extra
/// headers (rate-limit metadata).
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.to_string(),
            details: None,
            headers: Vec::new(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 429 with the full rate-limit header set.
    pub fn rate_limited(decision: &RateLimitDecision) -> Self {
        let window = decision.violated.unwrap_or(RateWindow::Minute);
        let mut headers = vec![
            ("Retry-After".to_string(), decision.retry_after_secs.to_string()),
            ("X-RateLimit-Remaining".to_string(), "0".to_string()),
        ];
        for state in &decision.windows {
            let suffix = state.window.header_suffix();
            headers.push((format!("X-RateLimit-Limit-{suffix}"), state.limit.to_string()));
            headers.push((
                format!("X-RateLimit-Remaining-{suffix}"),
                state.remaining.to_string(),
            ));
            headers.push((format!("X-RateLimit-Reset-{suffix}"), state.reset_unix.to_string()));
            if state.window == window {
                headers.push(("X-RateLimit-Limit".to_string(), state.limit.to_string()));
                headers.push(("X-RateLimit-Reset".to_string(), state.reset_unix.to_string()));
            }
        }
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "RATE_LIMIT_EXCEEDED".to_string(),
            message: format!("Rate limit exceeded for the {} window", window.label()),
            details: Some(json!({"window": window.label()})),
            headers,
        }
    }
}

impl From<JenguError> for ApiError {
    fn from(e: JenguError) -> Self {
        let status = match e.kind() {
            "validation" => StatusCode::BAD_REQUEST,
            "authentication" => StatusCode::UNAUTHORIZED,
            "authorization" => StatusCode::FORBIDDEN,
            "rate_limit" => StatusCode::TOO_MANY_REQUESTS,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "transient_upstream" | "permanent_upstream" | "quota_exceeded" => {
                StatusCode::BAD_GATEWAY
            }
            "timeout" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal details stay in the logs, never in the response.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation_id = uuid::Uuid::new_v4();
            warn!(%correlation_id, error = %e, "Internal error");
            format!("Internal error (correlation id {correlation_id})")
        } else {
            e.to_string()
        };
        Self::new(status, e.kind(), &message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.code,
            "message": self.message,
            "details": self.details,
        });
        let mut response = (self.status, Json(body)).into_response();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_bytes()),
                axum::http::HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Request identity
// ---------------------------------------------------------------------------

/// Caller IP: `X-Forwarded-For` (first hop) when present, else the
/// socket address.
pub fn client_ip(headers: &HeaderMap, request: &Request<Body>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

/// Middleware state: the app plus the scope this route class requires.
#[derive(Clone)]
pub struct RouteAuth {
    pub app: AppState,
    pub required_scope: Option<&'static str>,
}

pub async fn auth_middleware(
    State(route): State<RouteAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let headers = request.headers().clone();
    let ip = client_ip(&headers, &request);
    let endpoint = request.uri().path().to_string();
    let method = request.method().to_string();

    let presented = extract_presented_key(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        headers.get("x-api-key").and_then(|v| v.to_str().ok()),
    );
    let Some(presented) = presented else {
        // No credential at all: the unauthenticated fallback limit
        // applies, then the request is rejected.
        let decision = route
            .app
            .limiter
            .check_ip(&ip, route.app.config.auth.ip_requests_per_minute);
        if !decision.allowed {
            return ApiError::rate_limited(&decision).into_response();
        }
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "authentication",
            "missing_api_key",
        )
        .into_response();
    };

    let ctx = match route
        .app
        .auth
        .authenticate(&presented, &ip, route.required_scope)
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => return ApiError::from(e).into_response(),
    };

    // All three windows checked together; a violation carries the full
    // header set. Counter failures cannot happen in-process — were the
    // counters remote, a failed increment would log and fall open here.
    let decision = route.app.limiter.check_and_increment(
        &ctx.key_id,
        ctx.quota_per_minute,
        ctx.quota_per_hour,
        ctx.quota_per_day,
    );
    if !decision.allowed {
        let error = ApiError::rate_limited(&decision);
        route.app.auth.record_usage(UsageRecord {
            key_id: ctx.key_id.clone(),
            endpoint,
            method,
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            latency_ms: started.elapsed().as_millis() as u64,
            ip,
            error_type: Some(error.code.clone()),
            recorded_at: Utc::now(),
        });
        return error.into_response();
    }

    request.extensions_mut().insert(ctx.clone());
    let response = next.run(request).await;

    let status = response.status();
    let error_code = if status.is_success() {
        None
    } else {
        Some(status.canonical_reason().unwrap_or("error").to_string())
    };
    route.app.auth.record_usage(UsageRecord {
        key_id: ctx.key_id.clone(),
        endpoint,
        method,
        status: status.as_u16(),
        latency_ms: started.elapsed().as_millis() as u64,
        ip,
        error_type: error_code,
        recorded_at: Utc::now(),
    });

    response
}
