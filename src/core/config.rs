use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::coord::observer::NodeObserver;
use crate::core::errors::{PlanError, Result};

pub const MAX_RETRIES_LIMIT: u32 = 5;
pub const MAX_CONCURRENCY: usize = 10;

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_concurrency() -> usize {
    4
}

fn default_enable_trace() -> bool {
    true
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_loop_concurrency() -> usize {
    1
}

/// Tunables for one plan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries per node after the first attempt (0-5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-node timeout when the step does not set its own
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Maximum nodes running at once within a wavefront (1-10)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attach a full context snapshot to the final trace
    #[serde(default = "default_enable_trace")]
    pub enable_trace: bool,
    /// First backoff delay; doubles on every further retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Fan-out for loop/reduce steps that do not set `concurrency`
    #[serde(default = "default_loop_concurrency")]
    pub loop_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
            enable_trace: default_enable_trace(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            loop_concurrency: default_loop_concurrency(),
        }
    }
}

impl EngineConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(PlanError::configuration(format!(
                "max_retries must be between 0 and {}, got {}",
                MAX_RETRIES_LIMIT, self.max_retries
            )));
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(PlanError::configuration(format!(
                "concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.concurrency
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(PlanError::configuration(
                "default_timeout_ms must be greater than 0",
            ));
        }
        if self.loop_concurrency == 0 {
            return Err(PlanError::configuration(
                "loop_concurrency must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based): base * 2^(retry-1)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }
}

/// Cooperative cancellation flag shared between the host and a run.
///
/// The engine only looks at it at the top of each node attempt. A tool call
/// that is already in flight runs to completion (or to its timeout); there is
/// no preemption.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-run options: configuration plus the host-supplied hooks.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub config: EngineConfig,
    /// Defaults to a fresh UUID when not set
    pub plan_id: Option<String>,
    pub cancellation: Option<CancellationSignal>,
    pub observer: Option<Arc<dyn NodeObserver>>,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("config", &self.config)
            .field("plan_id", &self.plan_id)
            .field("cancellation", &self.cancellation)
            .field("observer", &self.observer.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_trace(mut self, enable: bool) -> Self {
        self.config.enable_trace = enable;
        self
    }

    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn NodeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map(CancellationSignal::is_cancelled)
            .unwrap_or(false)
    }
}
