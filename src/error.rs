use std::any::Any;
use std::sync::Mutex;

use thiserror::Error;

/// Failures reported by a native timer backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    #[error("no timer created (period {period_ms} ms, resolution {resolution_ms} ms)")]
    RegistrationRefused { period_ms: u32, resolution_ms: u32 },

    #[error("timer {id} could not be cancelled (status {status})")]
    CancelRefused { id: u32, status: u32 },

    #[error("timer capability query failed (status {0})")]
    Capabilities(u32),

    #[error("timer resolution of {0} ms was refused")]
    ResolutionRefused(u32),

    #[error("timer {0} is not registered")]
    UnknownTimer(u32),

    #[error("native timer service panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("invalid timer configuration: {0}")]
    Configuration(String),

    #[error("timer initialization failed: {0}")]
    Initialization(String),

    #[error("timer start failed: {0}")]
    StartFailure(#[source] NativeError),

    #[error("timer stop failed: {0}")]
    StopFailure(#[source] NativeError),

    #[error("tick dispatch failed: {0}")]
    Dispatch(String),

    #[error("tick accounting failed: {0}")]
    Accounting(String),

    #[error("wait failed: {0}")]
    Wait(String),

    #[error("config load failed: {0}")]
    Config(String),

    #[error(transparent)]
    Native(#[from] NativeError),
}

/// Most recent failure description of a timer; empty means no error.
#[derive(Debug, Default)]
pub struct LastError(Mutex<String>);

impl LastError {
    pub fn record(&self, err: &TimerError) {
        let message = err.to_string();
        match self.0.lock() {
            Ok(mut guard) => *guard = message,
            Err(poisoned) => *poisoned.into_inner() = message,
        }
    }

    pub fn get(&self) -> String {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_empty()
    }
}

/// Extracts the message of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_starts_empty_and_keeps_latest() {
        let last = LastError::default();
        assert!(last.is_empty());

        last.record(&TimerError::Dispatch("first".into()));
        last.record(&TimerError::StartFailure(NativeError::RegistrationRefused {
            period_ms: 5,
            resolution_ms: 1,
        }));

        let msg = last.get();
        assert!(msg.starts_with("timer start failed"));
        assert!(msg.contains("no timer created"));
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static text");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 7");
    }
}
