//! Pool and per-call configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default upper bound on live workers.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default time a worker gets to signal readiness.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding [`PoolConfig::max_workers`].
pub const MAX_WORKERS_ENV: &str = "TANDEM_MAX_WORKERS";

/// Environment variable pointing at the worker binary.
pub const WORKER_PATH_ENV: &str = "TANDEM_WORKER_PATH";

/// Environment variable overriding the startup timeout, in milliseconds.
pub const STARTUP_TIMEOUT_ENV: &str = "TANDEM_STARTUP_TIMEOUT_MS";

/// Kind of worker endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Adapter {
    /// An OS thread inside this process.
    #[default]
    Thread,
    /// A `tandem-worker` child process.
    Process,
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

impl FromStr for Adapter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "thread" | "worker_threads" => Ok(Self::Thread),
            "process" | "child_process" => Ok(Self::Process),
            other => Err(Error::Config(format!(
                "unknown adapter '{}', expected 'thread' or 'process'",
                other
            ))),
        }
    }
}

/// Configuration of a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live workers across both adapters.
    pub max_workers: usize,

    /// Worker binary for the process adapter.
    /// If None, the binary is looked up on first use.
    pub worker_program: Option<PathBuf>,

    /// Extra arguments passed to the worker binary.
    pub worker_args: Vec<String>,

    /// How long a new worker may take to report ready.
    pub startup_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            worker_program: None,
            worker_args: Vec::new(),
            startup_timeout: Some(DEFAULT_STARTUP_TIMEOUT),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(MAX_WORKERS_ENV) {
            let max = raw.trim().parse::<usize>().map_err(|e| {
                Error::Config(format!("{} must be a positive integer: {}", MAX_WORKERS_ENV, e))
            })?;
            config = config.with_max_workers(max)?;
        }

        if let Some(path) = lookup(WORKER_PATH_ENV) {
            if !path.is_empty() {
                config.worker_program = Some(PathBuf::from(path));
            }
        }

        if let Some(raw) = lookup(STARTUP_TIMEOUT_ENV) {
            let millis = raw.trim().parse::<u64>().map_err(|e| {
                Error::Config(format!("{} must be a number of milliseconds: {}", STARTUP_TIMEOUT_ENV, e))
            })?;
            // 0 disables the startup deadline.
            config.startup_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        Ok(config)
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        self.max_workers = max_workers;
        Ok(self)
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

/// Options for a single dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Exported function to invoke.
    pub function: String,

    /// Deadline for the whole call, waiting for a worker included.
    ///
    /// The worker is terminated when it passes. A thread worker only stops at
    /// its next `.await`; use [`Adapter::Process`] when functions may block.
    pub timeout: Option<Duration>,

    /// Return the worker to the pool instead of terminating it.
    pub keep_alive: bool,

    /// Which kind of worker to run on.
    pub adapter: Adapter,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            function: "default".to_string(),
            timeout: None,
            keep_alive: false,
            adapter: Adapter::Thread,
        }
    }
}

impl RunOptions {
    /// Options invoking `function` with everything else at its default.
    pub fn call(function: impl Into<String>) -> Self {
        Self::default().with_function(function)
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_adapter(mut self, adapter: Adapter) -> Self {
        self.adapter = adapter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.startup_timeout, Some(DEFAULT_STARTUP_TIMEOUT));

        let options = RunOptions::default();
        assert_eq!(options.function, "default");
        assert!(!options.keep_alive);
        assert_eq!(options.adapter, Adapter::Thread);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PoolConfig::from_lookup(lookup_from(&[
            (MAX_WORKERS_ENV, "4"),
            (WORKER_PATH_ENV, "/opt/tandem/tandem-worker"),
            (STARTUP_TIMEOUT_ENV, "0"),
        ]))
        .unwrap();

        assert_eq!(config.max_workers, 4);
        assert_eq!(config.worker_program, Some(PathBuf::from("/opt/tandem/tandem-worker")));
        assert_eq!(config.startup_timeout, None);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert!(matches!(
            PoolConfig::from_lookup(lookup_from(&[(MAX_WORKERS_ENV, "0")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PoolConfig::from_lookup(lookup_from(&[(MAX_WORKERS_ENV, "many")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PoolConfig::from_lookup(lookup_from(&[(STARTUP_TIMEOUT_ENV, "-5")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_adapter_parsing() {
        assert_eq!("thread".parse::<Adapter>().unwrap(), Adapter::Thread);
        assert_eq!("Process".parse::<Adapter>().unwrap(), Adapter::Process);
        assert!("fiber".parse::<Adapter>().is_err());
        assert_eq!(Adapter::Process.to_string(), "process");
    }

    #[test]
    fn test_run_options_builder() {
        let options = RunOptions::call("count")
            .with_timeout(Duration::from_millis(50))
            .with_keep_alive(true)
            .with_adapter(Adapter::Process);
        assert_eq!(options.function, "count");
        assert_eq!(options.timeout, Some(Duration::from_millis(50)));
        assert!(options.keep_alive);
        assert_eq!(options.adapter, Adapter::Process);
    }
}
