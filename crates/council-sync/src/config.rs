use std::env;
use std::time::Duration;

use council_bus::StompConfig;
use tracing::warn;

use crate::channel::ReconnectPolicy;

/// Sync client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// STOMP WebSocket endpoint (defaults to "ws://127.0.0.1:8080/ws/websocket")
    pub ws_url: String,
    /// REST API base (defaults to "http://127.0.0.1:8080/api")
    pub api_url: String,
    /// Bearer token sent on REST calls and the STOMP CONNECT frame
    pub token: Option<String>,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    /// Upper bound for a single REST call
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ws_url = normalize_localhost(
            env::var("COUNCIL_WS_URL").unwrap_or(defaults.ws_url),
        );
        let api_url = normalize_localhost(
            env::var("COUNCIL_API_URL").unwrap_or(defaults.api_url),
        );
        let token = env::var("COUNCIL_TOKEN").ok().filter(|t| !t.trim().is_empty());

        let base = defaults.reconnect;
        let reconnect = ReconnectPolicy {
            health_check: env_duration("COUNCIL_HEALTH_CHECK_SECS", base.health_check, Duration::from_secs),
            send_poll: env_duration("COUNCIL_SEND_POLL_MS", base.send_poll, Duration::from_millis),
            send_wait: env_duration("COUNCIL_SEND_WAIT_MS", base.send_wait, Duration::from_millis),
            backoff_initial: env_duration("COUNCIL_BACKOFF_INITIAL_MS", base.backoff_initial, Duration::from_millis),
            backoff_max: env_duration("COUNCIL_BACKOFF_MAX_MS", base.backoff_max, Duration::from_millis),
        };

        Self {
            ws_url,
            api_url,
            token,
            heartbeat: env_duration("COUNCIL_HEARTBEAT_MS", defaults.heartbeat, Duration::from_millis),
            connect_timeout: env_duration(
                "COUNCIL_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
                Duration::from_millis,
            ),
            request_timeout: env_duration(
                "COUNCIL_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
                Duration::from_millis,
            ),
            reconnect,
        }
    }

    pub fn stomp_config(&self) -> StompConfig {
        let config = StompConfig::new(self.ws_url.clone())
            .with_heartbeat(self.heartbeat)
            .with_connect_timeout(self.connect_timeout);
        match &self.token {
            Some(token) => config.with_connect_header("Authorization", format!("Bearer {token}")),
            None => config,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect.clone().normalized()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/ws/websocket".to_string(),
            api_url: "http://127.0.0.1:8080/api".to_string(),
            token: None,
            heartbeat: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// Avoid IPv6 (::1) resolution of localhost on dual-stack hosts.
fn normalize_localhost(url: String) -> String {
    if url.contains("://localhost") {
        url.replacen("://localhost", "://127.0.0.1", 1)
    } else {
        url
    }
}

fn env_duration(name: &str, default: Duration, unit: fn(u64) -> Duration) -> Duration {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => unit(value),
            Err(_) => {
                warn!(variable = name, value = %raw, "ignoring non-numeric setting");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 11] = [
        "COUNCIL_WS_URL",
        "COUNCIL_API_URL",
        "COUNCIL_TOKEN",
        "COUNCIL_HEALTH_CHECK_SECS",
        "COUNCIL_SEND_POLL_MS",
        "COUNCIL_SEND_WAIT_MS",
        "COUNCIL_BACKOFF_INITIAL_MS",
        "COUNCIL_BACKOFF_MAX_MS",
        "COUNCIL_HEARTBEAT_MS",
        "COUNCIL_CONNECT_TIMEOUT_MS",
        "COUNCIL_REQUEST_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.ws_url, "ws://127.0.0.1:8080/ws/websocket");
        assert_eq!(config.reconnect.health_check, Duration::from_secs(15));
        assert_eq!(config.reconnect.send_poll, Duration::from_millis(200));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(SyncConfig::from_env(), SyncConfig::default());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("COUNCIL_WS_URL", "ws://localhost:9000/ws/websocket");
            env::set_var("COUNCIL_TOKEN", "secret");
            env::set_var("COUNCIL_HEALTH_CHECK_SECS", "4");
            env::set_var("COUNCIL_BACKOFF_MAX_MS", "60000");
            env::set_var("COUNCIL_SEND_WAIT_MS", "not-a-number");
            env::set_var("COUNCIL_REQUEST_TIMEOUT_MS", "2500");
        }
        let config = SyncConfig::from_env();
        clear_env();

        assert_eq!(config.ws_url, "ws://127.0.0.1:9000/ws/websocket");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.reconnect.health_check, Duration::from_secs(4));
        assert_eq!(config.reconnect.send_wait, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_millis(2500));

        // The backoff cap never exceeds the health-check tick.
        assert_eq!(config.reconnect_policy().backoff_max, Duration::from_secs(4));

        let stomp = config.stomp_config();
        assert_eq!(
            stomp.connect_headers,
            vec![("Authorization".to_string(), "Bearer secret".to_string())]
        );
    }
}
