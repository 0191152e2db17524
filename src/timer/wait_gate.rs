use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use tracing::debug;

use crate::error::TimerError;
use crate::native::{NativeCallback, NativeTimerService, TimerMode};

/// Blocks the caller until a one-shot native timer fires or twice the
/// requested duration has passed.
#[derive(Clone)]
pub struct WaitGate {
    service: Arc<dyn NativeTimerService>,
}

impl WaitGate {
    pub fn new(service: Arc<dyn NativeTimerService>) -> Self {
        WaitGate { service }
    }

    pub fn wait(&self, duration_ms: u32) -> Result<bool, TimerError> {
        let caps = self.service.capabilities()?;
        if !caps.contains(duration_ms) {
            return Err(TimerError::Configuration(format!(
                "wait of {} ms is outside {}..={} ms",
                duration_ms, caps.period_min, caps.period_max
            )));
        }

        // The receiver lives for this call only; a late fire finds it gone.
        let (fired_tx, fired_rx) = bounded::<()>(1);
        let callback: NativeCallback = Arc::new(move |_| {
            let _ = fired_tx.try_send(());
        });

        let id = self
            .service
            .register(duration_ms, caps.period_min, TimerMode::OneShot, callback)?;

        let timeout = Duration::from_millis(u64::from(duration_ms) * 2);
        let fired = fired_rx.recv_timeout(timeout).is_ok();
        if !fired {
            debug!("[timer {}] wait of {} ms timed out", id, duration_ms);
        }
        Ok(fired)
    }

    /// Waits until `deadline`. A deadline already passed returns `true` at
    /// once; one closer than the shortest supported period waits that period.
    pub fn wait_until(&self, deadline: Instant) -> Result<bool, TimerError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(true);
        }
        let caps = self.service.capabilities()?;
        let millis = remaining.as_millis() + u128::from(remaining.subsec_nanos() % 1_000_000 != 0);
        let duration_ms = u32::try_from(millis)
            .unwrap_or(u32::MAX)
            .max(caps.period_min);
        self.wait(duration_ms)
    }

    /// Runs [`WaitGate::wait`] on tokio's blocking pool.
    pub async fn wait_async(&self, duration_ms: u32) -> Result<bool, TimerError> {
        let gate = self.clone();
        tokio::task::spawn_blocking(move || gate.wait(duration_ms))
            .await
            .map_err(|e| TimerError::Wait(e.to_string()))?
    }
}
