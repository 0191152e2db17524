use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TimerError;
use crate::native::{Capabilities, TimerMode};

pub const PERIOD_ENV: &str = "MMTIMER_PERIOD_MS";
pub const RUN_ENV: &str = "MMTIMER_RUN_MS";

/// Construction-time settings of a timer; fixed once the timer runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub period_ms: u32,
    /// `0` asks the timer source for its best accuracy.
    pub resolution_ms: u32,
    pub mode: TimerMode,
    pub auto_start: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            period_ms: 10,
            resolution_ms: 0,
            mode: TimerMode::Periodic,
            auto_start: true,
        }
    }
}

impl TimerConfig {
    pub fn periodic(period_ms: u32) -> Self {
        TimerConfig {
            period_ms,
            ..Self::default()
        }
    }

    pub fn one_shot(period_ms: u32) -> Self {
        TimerConfig {
            period_ms,
            mode: TimerMode::OneShot,
            ..Self::default()
        }
    }

    pub fn with_resolution(mut self, resolution_ms: u32) -> Self {
        self.resolution_ms = resolution_ms;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn validate(&self, caps: &Capabilities) -> Result<(), TimerError> {
        if !caps.contains(self.period_ms) {
            return Err(TimerError::Configuration(format!(
                "period {} ms is outside {}..={} ms",
                self.period_ms, caps.period_min, caps.period_max
            )));
        }
        if self.resolution_ms != 0 && !caps.contains(self.resolution_ms) {
            return Err(TimerError::Configuration(format!(
                "resolution {} ms is outside {}..={} ms",
                self.resolution_ms, caps.period_min, caps.period_max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    /// Daily-rolling log files go here when set.
    pub directory: Option<PathBuf>,
    pub file_name: String,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            directory: None,
            file_name: "mmtimer.log".to_string(),
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub timer: TimerConfig,
    pub log: LogConfig,
    /// How long the probe keeps the timer running.
    pub run_ms: u64,
    /// Duration of the probe's synchronous wait.
    pub wait_ms: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            timer: TimerConfig::default(),
            log: LogConfig::default(),
            run_ms: 1000,
            wait_ms: 20,
        }
    }
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self, TimerError> {
        serde_json::from_str(json).map_err(|e| TimerError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TimerError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| TimerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn with_env_overrides(self) -> Result<Self, TimerError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, TimerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(PERIOD_ENV) {
            self.timer.period_ms = value
                .trim()
                .parse()
                .map_err(|e| TimerError::Config(format!("{}={}: {}", PERIOD_ENV, value, e)))?;
        }
        if let Some(value) = lookup(RUN_ENV) {
            self.run_ms = value
                .trim()
                .parse()
                .map_err(|e| TimerError::Config(format!("{}={}: {}", RUN_ENV, value, e)))?;
        }
        Ok(self)
    }
}
