use sqlx::postgres::PgConnectOptions;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0} env")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn non_zero(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Credentials for the relational store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub connect_options: PgConnectOptions,
}

impl StoreConfig {
    /// `DATABASE_URL` wins; otherwise every `ARCHIVER_DB_*` part is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(url) = env::var("DATABASE_URL") {
            let connect_options =
                PgConnectOptions::from_str(&url).map_err(|_| ConfigError::Invalid {
                    key: "DATABASE_URL",
                    value: "<redacted>".to_string(),
                })?;
            return Ok(Self { connect_options });
        }

        let host = env_required("ARCHIVER_DB_HOST")?;
        let user = env_required("ARCHIVER_DB_USER")?;
        let pass = env_required("ARCHIVER_DB_PASS")?;
        let name = env_required("ARCHIVER_DB_NAME")?;
        let port_raw = env_string("ARCHIVER_DB_PORT", "5432");
        let port = port_raw
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid {
                key: "ARCHIVER_DB_PORT",
                value: port_raw.clone(),
            })?;

        let connect_options = PgConnectOptions::new()
            .host(&host)
            .username(&user)
            .password(&pass)
            .database(&name)
            .port(port);

        Ok(Self { connect_options })
    }
}

/// Configuration for the chat provider gateway client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("ARCHIVER_PROVIDER_URL", "http://127.0.0.1:8081"),
            token: env::var("ARCHIVER_PROVIDER_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            request_timeout: env_duration_millis("ARCHIVER_PROVIDER_TIMEOUT_MS", 150_000),
        }
    }
}

/// Sizing and timing of the worker pool, task slots and connection pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub max_connections: usize,
    pub max_queued_tasks: usize,
    /// One idle wait of a worker on the task queue.
    pub worker_idle_timeout: Duration,
    /// Consecutive idle waits after which a worker retires.
    pub worker_idle_cycles: usize,
    pub master_tick: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            max_workers: env_usize("ARCHIVER_MAX_WORKERS", 16),
            max_connections: env_usize("ARCHIVER_MAX_CONNECTIONS", 256),
            max_queued_tasks: env_usize("ARCHIVER_MAX_QUEUED_TASKS", 4096),
            worker_idle_timeout: env_duration_millis("ARCHIVER_WORKER_IDLE_TIMEOUT_MS", 5_000),
            worker_idle_cycles: env_usize("ARCHIVER_WORKER_IDLE_CYCLES", 10),
            master_tick: env_duration_millis("ARCHIVER_MASTER_TICK_MS", 10_000),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("ARCHIVER_MAX_WORKERS", self.max_workers)?;
        non_zero("ARCHIVER_MAX_CONNECTIONS", self.max_connections)?;
        non_zero("ARCHIVER_MAX_QUEUED_TASKS", self.max_queued_tasks)?;
        non_zero("ARCHIVER_WORKER_IDLE_CYCLES", self.worker_idle_cycles)?;
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            max_connections: 256,
            max_queued_tasks: 4096,
            worker_idle_timeout: Duration::from_secs(5),
            worker_idle_cycles: 10,
            master_tick: Duration::from_secs(10),
        }
    }
}

/// Duty cycle and batch sizes of the crawl coordinator.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub fast_rounds: usize,
    pub fast_interval: Duration,
    pub slow_rounds: usize,
    pub slow_interval: Duration,
    pub chat_list_limit: usize,
    pub history_window: usize,
    pub busy_retry: Duration,
    pub checkout_attempts: usize,
    pub checkout_retry: Duration,
    pub include_private_chats: bool,
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self {
            fast_rounds: env_usize("ARCHIVER_FAST_ROUNDS", 50),
            fast_interval: env_duration_millis("ARCHIVER_FAST_INTERVAL_MS", 1_000),
            slow_rounds: env_usize("ARCHIVER_SLOW_ROUNDS", 100),
            slow_interval: env_duration_millis("ARCHIVER_SLOW_INTERVAL_MS", 15_000),
            chat_list_limit: env_usize("ARCHIVER_CHAT_LIST_LIMIT", 300),
            history_window: env_usize("ARCHIVER_HISTORY_WINDOW", 100),
            busy_retry: env_duration_millis("ARCHIVER_BUSY_RETRY_MS", 1_000),
            checkout_attempts: env_usize("ARCHIVER_CHECKOUT_ATTEMPTS", 32),
            checkout_retry: env_duration_millis("ARCHIVER_CHECKOUT_RETRY_MS", 1_000),
            include_private_chats: env_bool("ARCHIVER_INCLUDE_PRIVATE_CHATS", false),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("ARCHIVER_HISTORY_WINDOW", self.history_window)?;
        non_zero("ARCHIVER_CHAT_LIST_LIMIT", self.chat_list_limit)?;
        non_zero("ARCHIVER_CHECKOUT_ATTEMPTS", self.checkout_attempts)?;
        if self.fast_rounds == 0 && self.slow_rounds == 0 {
            return Err(ConfigError::Invalid {
                key: "ARCHIVER_FAST_ROUNDS",
                value: "0 (and ARCHIVER_SLOW_ROUNDS=0)".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            fast_rounds: 50,
            fast_interval: Duration::from_secs(1),
            slow_rounds: 100,
            slow_interval: Duration::from_secs(15),
            chat_list_limit: 300,
            history_window: 100,
            busy_retry: Duration::from_secs(1),
            checkout_attempts: 32,
            checkout_retry: Duration::from_secs(1),
            include_private_chats: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_sizing() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.max_queued_tasks, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let config = SchedulerConfig {
            max_queued_tasks: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "ARCHIVER_MAX_QUEUED_TASKS",
                value: "0".to_string(),
            })
        );
    }

    #[test]
    fn test_crawl_needs_at_least_one_phase() {
        let config = CrawlConfig {
            fast_rounds: 0,
            slow_rounds: 0,
            ..CrawlConfig::default()
        };
        assert!(config.validate().is_err());

        let fast_only = CrawlConfig {
            slow_rounds: 0,
            ..CrawlConfig::default()
        };
        assert!(fast_only.validate().is_ok());
    }
}
