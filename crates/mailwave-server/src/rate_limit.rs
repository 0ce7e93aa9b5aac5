use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::warn;

use mailwave_shared::UserId;

use crate::api::AppState;
use crate::auth::{bearer_token, hash_token};
use crate::db::SharedDb;
use crate::error::ServerError;

/// Who a bucket belongs to. Only a token that resolves to a user earns its
/// own bucket; everything else is keyed by client address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerKey {
    User(UserId),
    Ip(IpAddr),
    /// No address available. All such requests share one bucket.
    Unknown,
}

impl std::fmt::Display for CallerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallerKey::User(id) => write!(f, "user:{id}"),
            CallerKey::Ip(ip) => write!(f, "ip:{ip}"),
            CallerKey::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<CallerKey, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: CallerKey) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let key = caller_key(&state.db, &req);
    if !state.rate_limiter.check(key.clone()).await {
        warn!(caller = %key, "Rate limit exceeded");
        return ServerError::RateLimited.into_response();
    }

    next.run(req).await
}

/// A known API token maps to its user, so callers behind one NAT do not
/// share a bucket. Unknown tokens fall back to the client address.
fn caller_key<B>(db: &SharedDb, req: &Request<B>) -> CallerKey {
    if let Some(token) = bearer_token(req.headers()) {
        let digest = hash_token(token);
        match db.with(|db| db.user_for_token_hash(&digest)) {
            Ok(Some(user_id)) => return CallerKey::User(user_id),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Token lookup failed in rate limiter"),
        }
    }
    extract_client_ip(req)
        .map(CallerKey::Ip)
        .unwrap_or(CallerKey::Unknown)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issue_token;
    use crate::delivery::tests::temp_db;
    use mailwave_shared::PlanTier;
    use mailwave_store::User;

    fn ip(s: &str) -> CallerKey {
        CallerKey::Ip(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10.0, 5.0);
        for _ in 0..5 {
            assert!(limiter.check(ip("127.0.0.1")).await);
        }
        assert!(!limiter.check(ip("127.0.0.1")).await);
    }

    #[tokio::test]
    async fn test_users_and_ips_are_separate_buckets() {
        let limiter = RateLimiter::new(0.0, 1.0);
        let (a, b) = (UserId::new(), UserId::new());
        assert!(limiter.check(ip("10.0.0.1")).await);
        assert!(!limiter.check(ip("10.0.0.1")).await);

        assert!(limiter.check(CallerKey::User(a)).await);
        assert!(limiter.check(CallerKey::User(b)).await);
        assert!(!limiter.check(CallerKey::User(a)).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(10.0, 5.0);
        assert!(limiter.check(ip("192.168.1.1")).await);

        limiter.purge_stale(0.0).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }

    #[test]
    fn test_caller_key_uses_only_known_tokens() {
        let (_dir, db) = temp_db();
        let user_id = UserId::new();
        let token = {
            let guard = db.lock().unwrap();
            guard
                .create_user(&User {
                    id: user_id,
                    email: "owner@example.com".into(),
                    plan: PlanTier::Pro,
                    created_at: chrono::Utc::now(),
                })
                .unwrap();
            issue_token(&guard, user_id).unwrap()
        };

        let req = Request::builder()
            .header("authorization", format!("Bearer {token}"))
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(caller_key(&db, &req), CallerKey::User(user_id));

        for forged in ["mw_forged_1", "mw_forged_2"] {
            let req = Request::builder()
                .header("authorization", format!("Bearer {forged}"))
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                .body(())
                .unwrap();
            assert_eq!(caller_key(&db, &req), ip("203.0.113.9"));
        }

        let req = Request::builder().body(()).unwrap();
        assert_eq!(caller_key(&db, &req), CallerKey::Unknown);
    }
}
