use std::str::FromStr;
use std::time::Duration;

use tether_taskq::layout::DEFAULT_QUEUE_BYTES;
use tether_thread::DEFAULT_STACK_SIZE;

use crate::error::ConfigError;

pub const ENV_MEMORY_BYTES: &str = "TETHER_MEMORY_BYTES";
pub const ENV_TLS_SIZE: &str = "TETHER_TLS_SIZE";
pub const ENV_THREAD_STACK_SIZE: &str = "TETHER_THREAD_STACK_SIZE";
pub const ENV_TASK_QUEUE_BYTES: &str = "TETHER_TASK_QUEUE_BYTES";
pub const ENV_DRAIN_POLL_MS: &str = "TETHER_DRAIN_POLL_MS";
pub const ENV_IDLE_WAIT_MS: &str = "TETHER_IDLE_WAIT_MS";
pub const ENV_STRICT_LEDGER: &str = "TETHER_STRICT_LEDGER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Size of the shared linear memory.
    pub memory_bytes: usize,
    /// Thread-local storage block size reported by the module.
    pub tls_size: u32,
    pub thread_stack_size: u32,
    pub task_queue_bytes: u32,
    /// Task worker poll interval while asynchronous operations are outstanding.
    pub drain_poll_interval: Duration,
    /// Longest single blocking wait of an idle task worker.
    pub idle_wait: Duration,
    /// Panic on double or untracked buffer releases.
    pub strict_ledger: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 64 << 20,
            tls_size: 256,
            thread_stack_size: DEFAULT_STACK_SIZE,
            task_queue_bytes: DEFAULT_QUEUE_BYTES,
            drain_poll_interval: Duration::from_millis(1),
            idle_wait: Duration::from_millis(500),
            strict_ledger: cfg!(debug_assertions),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by any `TETHER_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = parse(&lookup, ENV_MEMORY_BYTES)? {
            cfg.memory_bytes = v;
        }
        if let Some(v) = parse(&lookup, ENV_TLS_SIZE)? {
            cfg.tls_size = v;
        }
        if let Some(v) = parse(&lookup, ENV_THREAD_STACK_SIZE)? {
            cfg.thread_stack_size = v;
        }
        if let Some(v) = parse(&lookup, ENV_TASK_QUEUE_BYTES)? {
            cfg.task_queue_bytes = v;
        }
        if let Some(ms) = parse(&lookup, ENV_DRAIN_POLL_MS)? {
            cfg.drain_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, ENV_IDLE_WAIT_MS)? {
            cfg.idle_wait = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(ENV_STRICT_LEDGER) {
            cfg.strict_ledger = parse_bool(ENV_STRICT_LEDGER, &raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the runtime cannot start with. [`Runtime::start`] runs this too, so
    /// hand-built configs are covered.
    ///
    /// [`Runtime::start`]: crate::Runtime::start
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_bytes == 0 || self.memory_bytes > u32::MAX as usize {
            return Err(invalid(
                ENV_MEMORY_BYTES,
                self.memory_bytes.to_string(),
                "must be between 1 and 4294967295",
            ));
        }
        if self.task_queue_bytes < 12 {
            return Err(invalid(
                ENV_TASK_QUEUE_BYTES,
                self.task_queue_bytes.to_string(),
                "must hold at least one item slot",
            ));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(invalid(ENV_DRAIN_POLL_MS, "0".to_owned(), "must be at least 1"));
        }
        if self.idle_wait.is_zero() {
            return Err(invalid(ENV_IDLE_WAIT_MS, "0".to_owned(), "must be at least 1"));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|err: T::Err| invalid(var, raw.clone(), err.to_string()))
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw.to_owned(), "expected a boolean")),
    }
}

fn invalid(var: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidEnv {
        var,
        value,
        reason: reason.into(),
    }
}
