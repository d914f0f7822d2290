//! Request pipeline: logging, rate limiting, bearer auth, admission gates.
//!
//! Authentication inserts the [`Agent`] into request extensions; downstream
//! stages and handlers read it from there rather than re-fetching. The rate
//! limiter is an in-process, best-effort structure that only protects
//! registration and fails open on any internal error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::info;

use agentvault_core::{Agent, AgentStatus};

use super::error::ApiError;
use super::AppState;

/// Fixed rate-limit window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Entries beyond this trigger an opportunistic sweep of expired windows.
const SWEEP_THRESHOLD: usize = 1024;

// =========================================================================
// Request logging
// =========================================================================

pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

// =========================================================================
// Registration rate limit
// =========================================================================

struct Window {
    count: u32,
    started: Instant,
}

/// Per-IP fixed-window counter. Not durable, not distributed; losing state
/// under concurrency only ever lets a request through.
pub struct RateLimiter {
    max_per_window: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `key` may proceed. Fails open when the lock is poisoned.
    pub fn allow(&self, key: &str) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };
        let now = Instant::now();

        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.started) <= WINDOW);
        }

        match windows.get_mut(key) {
            Some(window) if now.duration_since(window.started) <= WINDOW => {
                if window.count >= self.max_per_window {
                    false
                } else {
                    window.count += 1;
                    true
                }
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        started: now,
                    },
                );
                true
            }
        }
    }
}

/// Client IP for rate limiting: `X-Forwarded-For` first element, then
/// `X-Real-IP`, then the peer address.
fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
    {
        return real_ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

pub async fn rate_limit_register(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(&request);
    if !state.rate_limiter.allow(&ip) {
        info!(%ip, "registration rate limit exceeded");
        return Err(ApiError::RateLimited);
    }
    Ok(next.run(request).await)
}

// =========================================================================
// Bearer authentication and admission gates
// =========================================================================

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthMissing)?;

    let token = header.strip_prefix("Bearer ").ok_or(ApiError::AuthInvalid)?;

    let agent = state
        .store
        .lookup_agent_by_token(token)
        .await?
        .ok_or(ApiError::AuthInvalid)?;

    request.extensions_mut().insert(agent);
    Ok(next.run(request).await)
}

/// Reject mutating calls unless the agent has been approved. Reads stay
/// available to pending and suspended agents so they can observe their state.
pub async fn require_active(request: Request, next: Next) -> Result<Response, ApiError> {
    // The auth stage always runs first; a missing agent here is a routing bug.
    let agent = request
        .extensions()
        .get::<Agent>()
        .ok_or(ApiError::AuthInvalid)?;

    if agent.status != AgentStatus::Active {
        return Err(ApiError::NotActive {
            status: agent.status,
        });
    }
    Ok(next.run(request).await)
}

// =========================================================================
// Admin key
// =========================================================================

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Gate `/v1/admin/*` behind the configured key list. The list supports
/// several comma-separated keys so rotation needs no downtime; an empty list
/// leaves the surface open for local development.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let accepted = state.config.admin_api_keys();
    if accepted.is_empty() {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthMissing)?;

    let mut matched = false;
    for key in accepted {
        matched |= constant_time_eq(presented, key);
    }
    if !matched {
        return Err(ApiError::AuthInvalid);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_window_cap() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));

        // Other keys are unaffected.
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn rate_limiter_keys_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
        assert!(!limiter.allow("b"));
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq("secret-key", "secret-key"));
        assert!(!constant_time_eq("secret-key", "secret-kez"));
        assert!(!constant_time_eq("secret-key", "secret"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }
}
