pub mod config;
pub mod error;
pub mod logger;
pub mod native;
pub mod timer;

pub use config::{AppConfig, LogConfig, TimerConfig};
pub use error::{NativeError, TimerError};
pub use native::{system_service, Capabilities, NativeTimerService, TimerId, TimerMode};
pub use timer::{TickEvent, TickStats, Timer, TimerBuilder, TimerState, WaitGate};
