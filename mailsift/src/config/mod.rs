//! Application configuration from the environment.
//!
//! Every setting has a default, so an empty environment yields a runnable
//! (if not very useful) configuration. Present but unparsable values are
//! configuration errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::analysis::OpenAiCompatConfig;
use crate::api::ApiServerConfig;
use crate::events::EventBusConfig;
use crate::lock::LockConfig;
use crate::logging::LoggingOptions;
use crate::pipeline::PipelineConfig;
use crate::pipeline::worker_pool::{MAX_WORKERS, MIN_WORKERS};
use crate::source::HttpMailboxSourceConfig;
use crate::task::TaskControllerConfig;
use crate::worker::AutoSyncConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:mailsift.db?mode=rwc";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub api: ApiServerConfig,
    pub source: HttpMailboxSourceConfig,
    pub analysis: OpenAiCompatConfig,
    /// Default analysis concurrency for runs that do not ask for one.
    pub analysis_workers: usize,
    pub pipeline: PipelineConfig,
    pub lock: LockConfig,
    pub task: TaskControllerConfig,
    pub bus: EventBusConfig,
    pub auto_sync_enabled: bool,
    pub auto_sync: AutoSyncConfig,
    pub reminder_webhook_url: Option<String>,
    pub logging: LoggingOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            api: ApiServerConfig::default(),
            source: HttpMailboxSourceConfig {
                base_url: "http://127.0.0.1:8025".to_string(),
                token: None,
                request_timeout: Duration::from_secs(30),
            },
            analysis: OpenAiCompatConfig::default(),
            analysis_workers: 3,
            pipeline,
            lock: LockConfig::default(),
            task: TaskControllerConfig::default(),
            bus: EventBusConfig::default(),
            auto_sync_enabled: true,
            auto_sync: AutoSyncConfig::default(),
            reminder_webhook_url: None,
            logging: LoggingOptions::default(),
        }
    }
}

/// Typed reads over a key lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| Error::config(format!("{key}={raw:?}: {e}")))
            })
            .transpose()
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::config(format!("{key}={raw:?}: expected a boolean"))),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(url) = env.string("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(addr) = env.string("API_BIND_ADDRESS") {
            config.api.bind_address = addr;
        }
        if let Some(port) = env.parse("API_PORT")? {
            config.api.port = port;
        }

        if let Some(url) = env.string("SOURCE_BASE_URL") {
            config.source.base_url = url;
        }
        config.source.token = env.string("SOURCE_TOKEN");

        if let Some(url) = env.string("ANALYSIS_BASE_URL") {
            config.analysis.base_url = url;
        }
        config.analysis.api_key = env.string("ANALYSIS_API_KEY");
        if let Some(model) = env.string("ANALYSIS_MODEL") {
            config.analysis.model = model;
        }
        if let Some(timeout) = env.secs("ANALYSIS_TIMEOUT_SECS")? {
            config.pipeline.call_timeout = timeout;
        }
        if let Some(workers) = env.parse::<usize>("ANALYSIS_WORKERS")? {
            config.analysis_workers = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        }
        if let Some(retries) = env.parse("ANALYSIS_SHRINK_RETRIES")? {
            config.pipeline.shrink_retries = retries;
        }

        if let Some(expiry) = env.secs("LOCK_EXPIRY_SECS")? {
            config.lock.expiry = expiry;
        }
        if let Some(timeout) = env.secs("LOCK_ACQUIRE_TIMEOUT_SECS")? {
            config.task.lock_acquire_timeout = timeout;
        }

        if let Some(capacity) = env.parse("BUS_HISTORY_CAPACITY")? {
            config.bus.history_capacity = capacity;
        }
        if let Some(keepalive) = env.secs("BUS_KEEPALIVE_SECS")? {
            config.bus.keepalive_interval = keepalive;
        }

        if let Some(enabled) = env.flag("AUTO_SYNC_ENABLED")? {
            config.auto_sync_enabled = enabled;
        }
        if let Some(interval) = env.secs("AUTO_SYNC_INTERVAL_SECS")? {
            config.auto_sync.interval = interval;
        }
        if let Some(max_items) = env.parse("AUTO_SYNC_MAX_ITEMS")? {
            config.auto_sync.max_items = max_items;
        }
        if let Some(days) = env.parse::<u64>("AUTO_SYNC_LOOKBACK_DAYS")? {
            config.auto_sync.lookback = Duration::from_secs(days * 24 * 3600);
        }
        config.auto_sync.concurrency = config.analysis_workers;

        config.reminder_webhook_url = env.string("REMINDER_WEBHOOK_URL");

        config.logging.log_dir = env.string("LOG_DIR").map(PathBuf::from);
        if let Some(json) = env.flag("LOG_JSON")? {
            config.logging.json = json;
        }

        if config.auto_sync.interval.is_zero() {
            return Err(Error::config("AUTO_SYNC_INTERVAL_SECS must be positive"));
        }

        Ok(config)
    }

    /// One line of startup context; secrets are not printed.
    pub fn log_summary(&self) {
        tracing::info!(
            database = %self.database_url,
            api = %format!("{}:{}", self.api.bind_address, self.api.port),
            source = %self.source.base_url,
            analysis_model = %self.analysis.model,
            workers = self.analysis_workers,
            auto_sync = self.auto_sync_enabled,
            webhook = self.reminder_webhook_url.is_some(),
            "configuration loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.api.port, 12580);
        assert_eq!(config.analysis_workers, 3);
        assert_eq!(config.lock.expiry, Duration::from_secs(300));
        assert_eq!(config.task.lock_acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.auto_sync.max_items, 50);
        assert!(config.auto_sync_enabled);
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_overrides_are_applied_and_clamped() {
        let config = load(&[
            ("API_PORT", "9000"),
            ("ANALYSIS_WORKERS", "32"),
            ("ANALYSIS_TIMEOUT_SECS", "5"),
            ("AUTO_SYNC_ENABLED", "no"),
            ("AUTO_SYNC_LOOKBACK_DAYS", "2"),
            ("SOURCE_TOKEN", "  "),
            ("LOG_DIR", "/var/log/mailsift"),
        ])
        .unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.analysis_workers, 8);
        assert_eq!(config.auto_sync.concurrency, 8);
        assert_eq!(config.pipeline.call_timeout, Duration::from_secs(5));
        assert!(!config.auto_sync_enabled);
        assert_eq!(config.auto_sync.lookback, Duration::from_secs(2 * 86400));
        assert!(config.source.token.is_none());
        assert_eq!(
            config.logging.log_dir,
            Some(PathBuf::from("/var/log/mailsift"))
        );
    }

    #[test]
    fn test_unparsable_value_is_a_configuration_error() {
        let err = load(&[("LOCK_EXPIRY_SECS", "five")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("LOCK_EXPIRY_SECS"));

        assert!(load(&[("LOG_JSON", "maybe")]).is_err());
        assert!(load(&[("AUTO_SYNC_INTERVAL_SECS", "0")]).is_err());
    }
}
