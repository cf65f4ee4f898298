use std::time::Duration;

use conductor_model_routing::{CatalogConfig, ProviderPolicy};
use conductor_session_management::{HealthMonitorConfig, SessionStoreConfig, SupervisorConfig};
use conductor_streaming::{HistoryConfig, PublisherConfig};

/// Everything tunable from the process environment, with the documented
/// defaults applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: u32,
    pub supervisor: SupervisorConfig,
    pub store: SessionStoreConfig,
    pub health: HealthMonitorConfig,
    pub publisher: PublisherConfig,
    pub history: HistoryConfig,
    pub provider_policy: ProviderPolicy,
    pub anthropic_base_url: Option<String>,
    pub openai_base_url: Option<String>,
    pub google_base_url: Option<String>,
    pub deepseek_base_url: Option<String>,
    pub catalog: CatalogConfig,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let mut supervisor = SupervisorConfig::default();
        supervisor.max_sessions_per_workspace =
            env_parse("MAX_CONCURRENT_SESSIONS", supervisor.max_sessions_per_workspace);
        supervisor.heartbeat_interval = env_millis(
            "HEARTBEAT_INTERVAL",
            supervisor.heartbeat_interval,
        );

        let mut health = HealthMonitorConfig::default();
        health.check_interval = env_millis("HEALTH_CHECK_INTERVAL", health.check_interval);
        health.stale_threshold = env_millis("STALE_THRESHOLD", health.stale_threshold);

        let mut provider_policy = ProviderPolicy::default();
        provider_policy.timeout = env_millis("PROVIDER_TIMEOUT_MS", provider_policy.timeout);

        let mut catalog = CatalogConfig::default();
        if let Some(base_url) = env_string("MODEL_REGISTRY_API_URL") {
            catalog.base_url = base_url;
        }
        catalog.auth_token = env_string("MODEL_REGISTRY_API_TOKEN");

        Self {
            redis_host: env_string("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
            redis_port: env_parse("REDIS_PORT", 6379),
            redis_password: env_string("REDIS_PASSWORD"),
            redis_db: env_parse("REDIS_DB", 0),
            supervisor,
            store: SessionStoreConfig::default(),
            health,
            publisher: PublisherConfig::default(),
            history: HistoryConfig::default(),
            provider_policy,
            anthropic_base_url: env_string("ANTHROPIC_BASE_URL"),
            openai_base_url: env_string("OPENAI_BASE_URL"),
            google_base_url: env_string("GOOGLE_AI_BASE_URL"),
            deepseek_base_url: env_string("DEEPSEEK_BASE_URL"),
            catalog,
            log_level: env_string("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    pub fn redis_url(&self) -> String {
        let auth = self
            .redis_password
            .as_ref()
            .map(|password| format!(":{password}@"))
            .unwrap_or_default();
        format!(
            "redis://{auth}{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(name, raw = %raw, "unparseable environment value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => raw.parse::<u64>().map(Duration::from_millis).unwrap_or_else(|_| {
            tracing::warn!(name, raw = %raw, "unparseable environment value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_includes_optional_password() {
        let mut config = Config::from_env();
        config.redis_host = "cache.internal".to_string();
        config.redis_port = 6380;
        config.redis_db = 2;
        config.redis_password = None;
        assert_eq!(config.redis_url(), "redis://cache.internal:6380/2");

        config.redis_password = Some("hunter2".to_string());
        assert_eq!(config.redis_url(), "redis://:hunter2@cache.internal:6380/2");
    }
}
