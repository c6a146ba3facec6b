use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::registry::TtlRegistry;
use crate::AppState;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Fixed-window request counter per client IP.
#[derive(Clone)]
pub struct RateLimiter {
    windows: TtlRegistry<IpAddr, (u32, Instant)>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: TtlRegistry::new(RATE_WINDOW),
        }
    }

    /// Check if the request is allowed.
    ///
    /// Returns `true` if allowed, `false` if limit exceeded.
    pub fn check(&self, ip: IpAddr, limit: u32) -> bool {
        let now = Instant::now();
        let (count, _) = self.windows.update(ip, |window| match window {
            Some((count, start)) if now.duration_since(start) <= RATE_WINDOW => {
                (count.saturating_add(1), start)
            }
            _ => (1, now),
        });
        count <= limit
    }

    /// Drops expired windows; returns how many.
    pub fn sweep(&self) -> usize {
        self.windows.sweep().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiting middleware for the call API.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    // Without ConnectInfo the server was started without
    // `into_make_service_with_connect_info`; that is a wiring bug.
    let ConnectInfo(addr) = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .copied()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    if !state
        .rate_limiter
        .check(addr.ip(), state.config.server.call_rate_limit)
    {
        tracing::warn!(ip = %addr.ip(), path = %req.uri().path(), "rate limit exceeded");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            axum::http::HeaderValue::from_static("60"),
        );
        return Ok(response);
    }

    Ok(next.run(req).await)
}

/// Computes the vendor request signature: base64 HMAC-SHA1 over the full
/// request URL followed by each form parameter's name and value, sorted by
/// name.
pub fn request_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut payload = String::from(url);
    for (name, value) in sorted {
        payload.push_str(name);
        payload.push_str(value);
    }

    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Outcome of a webhook signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    Missing,
    Skipped,
}

/// Checks `X-Twilio-Signature` for a webhook. Never rejects: a failed check
/// is logged and the request continues with degraded validation.
pub fn check_signature(
    state: &AppState,
    headers: &HeaderMap,
    path_and_query: &str,
    params: &[(String, String)],
) -> SignatureCheck {
    let telephony = &state.config.telephony;
    if !telephony.validate_signatures || telephony.auth_token.is_empty() {
        return SignatureCheck::Skipped;
    }
    let Some(provided) = headers
        .get("X-Twilio-Signature")
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!(path = path_and_query, "webhook without signature header");
        return SignatureCheck::Missing;
    };

    let url = format!(
        "{}{}",
        state.config.server.public_url.trim_end_matches('/'),
        path_and_query
    );
    let expected = request_signature(&telephony.auth_token, &url, params);
    if expected.as_bytes() == provided.as_bytes() {
        SignatureCheck::Valid
    } else {
        tracing::warn!(path = path_and_query, "webhook signature mismatch, continuing");
        SignatureCheck::Invalid
    }
}
