//! Configuration for the module controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use extmod_reconcile::DEFAULT_CHECK_INTERVAL;

/// Module controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the external module tree. `None` disables the controller.
    pub modules_dir: Option<PathBuf>,

    /// Workers per queue.
    pub workers: usize,

    /// Retry delay for policy-blocked releases and overridden modules.
    pub check_interval: Duration,

    /// Quiet period before a restart is requested.
    pub restart_delay: Duration,

    /// Deadline for each store and documentation call.
    pub request_timeout: Duration,

    /// Process that receives restart signals.
    pub restart_pid: i32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modules_dir: None,
            workers: 3,
            check_interval: DEFAULT_CHECK_INTERVAL,
            restart_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            restart_pid: 1,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let modules_dir = lookup("EXTERNAL_MODULES_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let workers = parse(&lookup, "MODULE_CONTROLLER_WORKERS")?
            .unwrap_or(defaults.workers)
            .max(1);

        let check_interval = parse(&lookup, "MODULE_CONTROLLER_CHECK_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_interval);

        let restart_delay = parse(&lookup, "MODULE_CONTROLLER_RESTART_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.restart_delay);

        let request_timeout = parse(&lookup, "MODULE_CONTROLLER_REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        let restart_pid =
            parse(&lookup, "MODULE_CONTROLLER_RESTART_PID")?.unwrap_or(defaults.restart_pid);

        let log_level = lookup("MODULE_CONTROLLER_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            modules_dir,
            workers,
            check_interval,
            restart_delay,
            request_timeout,
            restart_pid,
            log_level,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .parse()
                .with_context(|| format!("{} must be a number, got {:?}", key, value))
        })
        .transpose()
}
