//! Bridge settings objects and initialization
#[macro_use]
extern crate slog_scope;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use url::Url;

static PREFIX: &str = "async";

static DEFAULT_WORKER_COUNT: u32 = 4;
static DEFAULT_QUERY_TIMEOUT: u64 = 30;
static DEFAULT_CACHE_TTL: u64 = 300;
static DEFAULT_HEALTH_CHECK_INTERVAL: u64 = 300;

/// Advisory retry policy for transient failures (deadlocks, timeouts).
///
/// The dispatcher stores this but the base dispatch path never retries;
/// `call_with_retry` is the opt-in consumer.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    /// Delay before the first retry, in seconds
    pub initial_delay: u64,
    /// Backoff multiplier applied per attempt
    pub factor: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1,
            factor: 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Opaque connect info handed to the backend inside each worker
    pub database_url: String,

    /// Number of worker threads, each owning one database connection
    pub worker_count: u32,

    /// Per-call timeout, in seconds (health probes use their own 5s timeout)
    pub query_timeout: u64,

    /// Statements run once on every fresh connection, in order
    pub on_connect_do: Vec<String>,

    /// Lifetime of cached query results, in seconds. 0 means entries never
    /// expire; the dispatcher normalizes this at create time.
    pub cache_ttl: u64,

    /// Seconds between health-check sweeps. 0 disables the sweep.
    pub health_check_interval: u64,

    pub retry: RetrySettings,

    pub enable_metrics: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,

    pub human_logs: bool,

    /// Diagnostic emissions at every dispatch stage. `ASYNC_TRACE=1` in the
    /// environment lands here through the settings env layer.
    pub trace: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            database_url: "sqlite://:memory:".to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            on_connect_do: vec![],
            cache_ttl: DEFAULT_CACHE_TTL,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            retry: RetrySettings::default(),
            enable_metrics: false,
            statsd_host: None,
            statsd_port: 8125,
            statsd_label: "db-async".to_string(),
            human_logs: false,
            trace: false,
        }
    }
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        // Merge the config file if supplied
        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        // Merge the environment overrides
        // While the prefix is currently case insensitive, it's traditional that
        // environment vars be UPPERCASE, this ensures that will continue should
        // Environment ever change their policy about case insensitivity.
        // This will accept environment variables specified as
        // `ASYNC_RETRY__MAX_RETRIES=5` as `retry.max_retries = 5`
        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(s) => Ok(s),
            // Configuration errors are not very sysop friendly, Try to make them
            // a bit more 3AM useful.
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `database_url` use env var `{}_DATABASE_URL`\n",
                    PREFIX.to_uppercase()
                );
                error!("Configuration error: Value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: Other: {:?}", &e);
                Err(e)
            }
        }
    }

    #[cfg(debug_assertions)]
    pub fn test_settings() -> Self {
        let mut settings =
            Self::with_env_and_config_file(None).expect("Could not get Settings in test_settings");
        settings.worker_count = 2;
        settings.health_check_interval = 0;
        settings.enable_metrics = false;
        settings
    }

    pub fn banner(&self) -> String {
        let db = Url::parse(&self.database_url)
            .map(|url| url.scheme().to_owned())
            .unwrap_or_else(|_| "<invalid db>".to_owned());
        format!("{} ({} workers)", db, self.worker_count)
    }
}

#[cfg(test)]
mod test {
    use std::env;

    use super::*;

    #[test]
    fn test_environment_variable_prefix() {
        env::set_var("ASYNC_WORKER_COUNT", "7");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.worker_count, 7);

        // Setting an environment variable with the incorrect prefix does not
        // set the setting
        env::remove_var("ASYNC_WORKER_COUNT");
        env::set_var("ASYNCDB_WORKER_COUNT", "9");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert_eq!(settings.worker_count, DEFAULT_WORKER_COUNT);
        env::remove_var("ASYNCDB_WORKER_COUNT");
    }

    #[test]
    fn test_trace_toggle() {
        env::set_var("ASYNC_TRACE", "1");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        assert!(settings.trace);
        env::remove_var("ASYNC_TRACE");
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.worker_count, 4);
        assert_eq!(settings.query_timeout, 30);
        assert_eq!(settings.cache_ttl, 300);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.initial_delay, 1);
        assert_eq!(settings.retry.factor, 2);
    }
}
