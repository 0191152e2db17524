// native/mod.rs

pub mod mock;
pub mod resolution;
pub mod thread;
#[cfg(windows)]
pub mod winmm;

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};

use crate::error::NativeError;

/// Handle of a registered native timer. The native `0` sentinel never becomes a `TimerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(NonZeroU32);

impl TimerId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    OneShot,
    #[default]
    Periodic,
}

/// Supported period range of a timer source, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub period_min: u32,
    pub period_max: u32,
}

impl Capabilities {
    pub fn contains(&self, ms: u32) -> bool {
        (self.period_min..=self.period_max).contains(&ms)
    }
}

/// Invoked by the service on its own thread with the firing registration's handle.
pub type NativeCallback = Arc<dyn Fn(TimerId) + Send + Sync>;

pub trait NativeTimerService: Send + Sync {
    /// Supported period range; queried once per service and cached.
    fn capabilities(&self) -> Result<Capabilities, NativeError>;

    /// Periodic registrations must cancel synchronously: once `cancel` returns,
    /// no callback of that registration is running or will run.
    fn register(
        &self,
        period_ms: u32,
        resolution_ms: u32,
        mode: TimerMode,
        callback: NativeCallback,
    ) -> Result<TimerId, NativeError>;

    fn cancel(&self, id: TimerId) -> Result<(), NativeError>;

    fn name(&self) -> String;
}

/// Once-only capability value guarded by the cell's initialization lock.
#[derive(Debug, Default)]
pub struct CapabilityCache(OnceCell<Capabilities>);

impl CapabilityCache {
    pub fn new() -> Self {
        Self(OnceCell::new())
    }

    pub fn get_or_query<F>(&self, query: F) -> Result<Capabilities, NativeError>
    where
        F: FnOnce() -> Result<Capabilities, NativeError>,
    {
        self.0.get_or_try_init(query).copied()
    }
}

static SYSTEM_SERVICE: Lazy<Arc<dyn NativeTimerService>> = Lazy::new(|| {
    #[cfg(windows)]
    {
        Arc::new(winmm::WinmmTimerService::new())
    }
    #[cfg(not(windows))]
    {
        Arc::new(thread::ThreadTimerService::new())
    }
});

/// The process-wide timer source for this platform.
pub fn system_service() -> Arc<dyn NativeTimerService> {
    SYSTEM_SERVICE.clone()
}
