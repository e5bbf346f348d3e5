use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tokio::sync::Mutex;

use super::{ApiError, AppState, SESSION_COOKIE_NAME};

const THROTTLE_WINDOW_SECONDS: i64 = 60;
const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_X_REAL_IP: &str = "x-real-ip";

/// Raw session token of a verified admin request, kept for logout.
#[derive(Clone, Debug)]
pub(super) struct SessionToken(pub(super) String);

#[derive(Clone, Default)]
pub(super) struct ThrottleState {
    buckets: Arc<Mutex<HashMap<String, VecDeque<i64>>>>,
}

pub(super) async fn admin_session_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = session_token_from_headers(request.headers()) else {
        return ApiError::Unauthenticated.into_response();
    };
    match state.sessions.verify(&token).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            request.extensions_mut().insert(SessionToken(token));
            next.run(request).await
        }
        Err(error) => ApiError::from_session(error).into_response(),
    }
}

pub(super) async fn login_throttle_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = format!("login:{}", throttle_identity(&state, &request));
    let limit = state.config.login_rate_limit_per_minute;
    throttled(&state.throttle, &key, limit, request, next).await
}

pub(super) async fn sync_throttle_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = format!("sync:{}", throttle_identity(&state, &request));
    let limit = state.config.rate_limit_per_minute;
    throttled(&state.throttle, &key, limit, request, next).await
}

fn throttle_identity(state: &AppState, request: &Request) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    request_identity_key(request.headers(), peer, state.config.trust_forwarded_for)
}

async fn throttled(
    throttle: &ThrottleState,
    key: &str,
    max_requests: usize,
    request: Request,
    next: Next,
) -> Response {
    let now_epoch = Utc::now().timestamp();
    match consume_throttle_token(throttle, key, max_requests, THROTTLE_WINDOW_SECONDS, now_epoch)
        .await
    {
        Ok(()) => next.run(request).await,
        Err(retry_after_seconds) => {
            tracing::warn!(bucket = %key, retry_after_seconds, "request throttled");
            ApiError::RateLimited {
                retry_after_seconds,
            }
            .into_response()
        }
    }
}

/// Sliding-window limiter. Returns the seconds until a slot frees up when the
/// bucket is full. Buckets with nothing left inside the window are dropped.
async fn consume_throttle_token(
    throttle: &ThrottleState,
    bucket_key: &str,
    max_requests: usize,
    window_seconds: i64,
    now_epoch: i64,
) -> Result<(), i64> {
    let window_start = now_epoch - window_seconds;

    let mut buckets = throttle.buckets.lock().await;
    buckets.retain(|_, bucket| {
        while bucket.front().is_some_and(|oldest| *oldest < window_start) {
            let _ = bucket.pop_front();
        }
        !bucket.is_empty()
    });
    let bucket = buckets.entry(bucket_key.to_string()).or_default();

    if bucket.len() >= max_requests {
        let retry_after = bucket
            .front()
            .map(|oldest| ((*oldest + window_seconds) - now_epoch).max(1))
            .unwrap_or(1);
        return Err(retry_after);
    }

    bucket.push_back(now_epoch);
    Ok(())
}

fn session_token_from_headers(headers: &HeaderMap) -> Option<String> {
    extract_cookie_value(headers, SESSION_COOKIE_NAME).or_else(|| bearer_token(headers))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = raw.strip_prefix("Bearer ")?.trim();
    non_empty(token)
}

fn extract_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in raw.split(';') {
        let mut pieces = part.trim().splitn(2, '=');
        let key = pieces.next()?.trim();
        let Some(value) = pieces.next() else {
            continue;
        };
        if key == cookie_name {
            return non_empty(value.trim());
        }
    }
    None
}

/// Forwarding headers are caller-controlled, so they only count when the
/// deployment says a proxy rewrites them.
fn request_identity_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        if let Some(value) = header_string(headers, HEADER_X_FORWARDED_FOR) {
            let first_ip = value.split(',').next().unwrap_or_default().trim();
            if !first_ip.is_empty() {
                return format!("ip:{first_ip}");
            }
        }

        if let Some(value) = header_string(headers, HEADER_X_REAL_IP) {
            let ip = value.trim();
            if !ip.is_empty() {
                return format!("ip:{ip}");
            }
        }
    }

    match peer {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::http::{HeaderMap, HeaderValue, header};

    use super::{
        ThrottleState, consume_throttle_token, extract_cookie_value, request_identity_key,
        session_token_from_headers,
    };

    #[tokio::test]
    async fn throttle_rejects_once_window_is_full() {
        let throttle = ThrottleState::default();
        for _ in 0..3 {
            assert!(consume_throttle_token(&throttle, "k", 3, 60, 1_000).await.is_ok());
        }
        let retry_after = consume_throttle_token(&throttle, "k", 3, 60, 1_010).await;
        assert_eq!(retry_after, Err(50));
        assert!(consume_throttle_token(&throttle, "other", 3, 60, 1_010).await.is_ok());
        assert!(consume_throttle_token(&throttle, "k", 3, 60, 1_061).await.is_ok());
    }

    #[tokio::test]
    async fn expired_buckets_are_evicted() {
        let throttle = ThrottleState::default();
        for index in 0..100 {
            let key = format!("login:ip:10.0.0.{index}");
            assert!(consume_throttle_token(&throttle, &key, 1, 60, 1_000).await.is_ok());
        }
        assert_eq!(throttle.buckets.lock().await.len(), 100);

        assert!(consume_throttle_token(&throttle, "login:ip:10.0.1.1", 1, 60, 1_061).await.is_ok());
        let buckets = throttle.buckets.lock().await;
        assert_eq!(buckets.len(), 1);
        assert!(buckets.contains_key("login:ip:10.0.1.1"));
    }

    #[test]
    fn cookie_wins_over_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; admin_session=cookie-token; flag"),
        );
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        assert_eq!(
            extract_cookie_value(&headers, "admin_session").as_deref(),
            Some("cookie-token")
        );
        assert_eq!(
            session_token_from_headers(&headers).as_deref(),
            Some("cookie-token")
        );

        headers.remove(header::COOKIE);
        assert_eq!(
            session_token_from_headers(&headers).as_deref(),
            Some("header-token")
        );
    }

    #[test]
    fn identity_key_uses_peer_unless_forwarding_is_trusted() {
        let peer = Some(SocketAddr::from(([192, 0, 2, 10], 50_123)));
        let mut headers = HeaderMap::new();
        assert_eq!(request_identity_key(&headers, None, false), "ip:unknown");
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(request_identity_key(&headers, peer, false), "ip:192.0.2.10");
        assert_eq!(request_identity_key(&headers, peer, true), "ip:10.0.0.9");
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(request_identity_key(&headers, peer, false), "ip:192.0.2.10");
        assert_eq!(request_identity_key(&headers, peer, true), "ip:203.0.113.7");
    }
}
