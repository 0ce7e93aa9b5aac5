//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mailwave_shared::constants::{
    DEFAULT_FAST_PATH_THRESHOLD, DEFAULT_HTTP_PORT, DEFAULT_WORKER_CONCURRENCY,
    DEFAULT_WORKER_MAX_QUEUES,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./mailwave.db`
    pub database_path: PathBuf,

    /// Largest batch delivered inline, inside the initiating request.
    /// Env: `FAST_PATH_THRESHOLD`
    /// Default: `20`
    pub fast_path_threshold: u32,

    /// Records delivered in parallel by the background worker.
    /// Env: `WORKER_CONCURRENCY`
    /// Default: `4`
    pub worker_concurrency: usize,

    /// Queues the worker delivers at the same time. Records in flight never
    /// exceed `worker_max_queues * worker_concurrency`.
    /// Env: `WORKER_MAX_QUEUES`
    /// Default: `2`
    pub worker_max_queues: usize,

    /// Capacity of the worker job channel.
    /// Env: `WORKER_QUEUE_CAPACITY`
    /// Default: `256`
    pub worker_queue_capacity: usize,

    // -- Delivery provider --

    /// Env: `PROVIDER_API_URL`
    /// Default: `https://api.resend.com`
    pub provider_api_url: String,

    /// Env: `PROVIDER_API_KEY`
    /// Default: none (requests go out unauthenticated).
    pub provider_api_key: Option<String>,

    /// Env: `PROVIDER_TIMEOUT_SECS`
    /// Default: `30`
    pub provider_timeout: Duration,

    /// Env: `FROM_ADDRESS`
    pub from_address: String,

    /// Target of the footer link appended to every email.
    /// Env: `UNSUBSCRIBE_BASE_URL`
    pub unsubscribe_base_url: String,

    /// A queue with zero progress older than this is reported as stuck.
    /// Env: `STUCK_AFTER_SECS`
    /// Default: `60`
    pub stuck_after: Duration,

    /// Service bearer token for `/admin/*` and worker re-invocation.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Per-caller token bucket.
    /// Env: `RATE_LIMIT_PER_SEC`, `RATE_LIMIT_BURST`
    /// Default: `5` / `20`
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./mailwave.db"),
            fast_path_threshold: DEFAULT_FAST_PATH_THRESHOLD,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            worker_max_queues: DEFAULT_WORKER_MAX_QUEUES,
            worker_queue_capacity: 256,
            provider_api_url: "https://api.resend.com".to_string(),
            provider_api_key: None,
            provider_timeout: Duration::from_secs(30),
            from_address: "Mailwave <campaigns@mailwave.app>".to_string(),
            unsubscribe_base_url: "http://localhost:8080/unsubscribe".to_string(),
            stuck_after: Duration::from_secs(60),
            admin_token: None,
            rate_limit_per_sec: 5.0,
            rate_limit_burst: 20.0,
        }
    }
}

// Secrets stay out of the startup log line.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("fast_path_threshold", &self.fast_path_threshold)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("worker_max_queues", &self.worker_max_queues)
            .field("worker_queue_capacity", &self.worker_queue_capacity)
            .field("provider_api_url", &self.provider_api_url)
            .field("provider_api_key", &self.provider_api_key.as_ref().map(|_| "***"))
            .field("provider_timeout", &self.provider_timeout)
            .field("from_address", &self.from_address)
            .field("unsubscribe_base_url", &self.unsubscribe_base_url)
            .field("stuck_after", &self.stuck_after)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "***"))
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup. Invalid values log a
    /// warning and keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);
        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        parse_into(&lookup, "FAST_PATH_THRESHOLD", &mut config.fast_path_threshold);
        parse_into(&lookup, "WORKER_CONCURRENCY", &mut config.worker_concurrency);
        parse_into(&lookup, "WORKER_MAX_QUEUES", &mut config.worker_max_queues);
        parse_into(&lookup, "WORKER_QUEUE_CAPACITY", &mut config.worker_queue_capacity);
        // Zero would stall the worker forever.
        config.worker_concurrency = config.worker_concurrency.max(1);
        config.worker_max_queues = config.worker_max_queues.max(1);
        config.worker_queue_capacity = config.worker_queue_capacity.max(1);

        // -- Provider --

        if let Some(url) = lookup("PROVIDER_API_URL") {
            config.provider_api_url = url.trim_end_matches('/').to_string();
        }
        config.provider_api_key = non_empty(lookup("PROVIDER_API_KEY"));

        let mut timeout_secs = config.provider_timeout.as_secs();
        parse_into(&lookup, "PROVIDER_TIMEOUT_SECS", &mut timeout_secs);
        config.provider_timeout = Duration::from_secs(timeout_secs);

        if let Some(from) = non_empty(lookup("FROM_ADDRESS")) {
            config.from_address = from;
        }
        if let Some(base) = non_empty(lookup("UNSUBSCRIBE_BASE_URL")) {
            config.unsubscribe_base_url = base;
        }

        let mut stuck_secs = config.stuck_after.as_secs();
        parse_into(&lookup, "STUCK_AFTER_SECS", &mut stuck_secs);
        config.stuck_after = Duration::from_secs(stuck_secs);

        config.admin_token = non_empty(lookup("ADMIN_TOKEN"));

        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.fast_path_threshold, 20);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.worker_max_queues, 2);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("FAST_PATH_THRESHOLD", "5"),
            ("PROVIDER_API_URL", "http://mock.local/"),
            ("PROVIDER_TIMEOUT_SECS", "3"),
            ("ADMIN_TOKEN", "s3cret"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.fast_path_threshold, 5);
        assert_eq!(config.provider_api_url, "http://mock.local");
        assert_eq!(config.provider_timeout, Duration::from_secs(3));
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("FAST_PATH_THRESHOLD", "-1"),
            ("WORKER_CONCURRENCY", "0"),
            ("WORKER_MAX_QUEUES", "0"),
            ("ADMIN_TOKEN", "  "),
        ]);
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.fast_path_threshold, 20);
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(config.worker_max_queues, 1);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = from_pairs(&[("PROVIDER_API_KEY", "re_live_key"), ("ADMIN_TOKEN", "tok")]);
        let printed = format!("{config:?}");
        assert!(!printed.contains("re_live_key"));
        assert!(!printed.contains("tok\""));
    }
}
