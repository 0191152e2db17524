use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::error::{panic_message, NativeError};
use crate::native::{
    Capabilities, CapabilityCache, NativeCallback, NativeTimerService, TimerId, TimerMode,
};

const THREAD_CAPABILITIES: Capabilities = Capabilities {
    period_min: 1,
    period_max: 1_000_000,
};

/// Portable timer source: one service thread per registration.
///
/// Cancellation is always synchronous. `cancel` signals the thread and joins it,
/// so an in-flight callback finishes before `cancel` returns. Cancelling from the
/// timer's own callback skips the join.
pub struct ThreadTimerService {
    timers: Arc<Mutex<HashMap<TimerId, ThreadTimer>>>,
    next_id: AtomicU32,
    capabilities: CapabilityCache,
}

struct ThreadTimer {
    handle: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
}

impl ThreadTimer {
    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl ThreadTimerService {
    pub fn new() -> Self {
        ThreadTimerService {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
            capabilities: CapabilityCache::new(),
        }
    }

    fn allocate_id(&self) -> TimerId {
        loop {
            if let Some(id) = TimerId::new(self.next_id.fetch_add(1, Ordering::Relaxed)) {
                return id;
            }
        }
    }

    pub fn active_timers(&self) -> usize {
        let timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.values().filter(|t| !t.is_finished()).count()
    }
}

impl Default for ThreadTimerService {
    fn default() -> Self {
        Self::new()
    }
}

fn run_timer(
    id: TimerId,
    period: Duration,
    mode: TimerMode,
    callback: NativeCallback,
    stop_rx: crossbeam_channel::Receiver<()>,
) {
    let mut deadline = Instant::now() + period;
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match stop_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(id))) {
            error!("[timer {}] callback panicked: {}", id, panic_message(&*payload));
        }

        if mode == TimerMode::OneShot {
            break;
        }

        // A late callback re-anchors the schedule instead of bursting to catch up.
        deadline += period;
        let now = Instant::now();
        if deadline < now {
            deadline = now;
        }
    }
    debug!("[timer {}] service thread exiting", id);
}

impl NativeTimerService for ThreadTimerService {
    fn capabilities(&self) -> Result<Capabilities, NativeError> {
        self.capabilities.get_or_query(|| Ok(THREAD_CAPABILITIES))
    }

    fn register(
        &self,
        period_ms: u32,
        resolution_ms: u32,
        mode: TimerMode,
        callback: NativeCallback,
    ) -> Result<TimerId, NativeError> {
        if !THREAD_CAPABILITIES.contains(period_ms) {
            return Err(NativeError::RegistrationRefused {
                period_ms,
                resolution_ms,
            });
        }

        let id = self.allocate_id();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let period = Duration::from_millis(u64::from(period_ms));

        let handle = thread::Builder::new()
            .name(format!("mmtimer-{}", id))
            .spawn(move || run_timer(id, period, mode, callback, stop_rx))
            .map_err(|e| {
                error!("failed to spawn timer thread: {}", e);
                NativeError::RegistrationRefused {
                    period_ms,
                    resolution_ms,
                }
            })?;

        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.retain(|_, t| !t.is_finished());
        timers.insert(
            id,
            ThreadTimer {
                handle: Some(handle),
                stop_tx: Some(stop_tx),
            },
        );
        debug!("[timer {}] registered {:?} every {} ms", id, mode, period_ms);
        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> Result<(), NativeError> {
        let timer = self
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        let Some(mut timer) = timer else {
            return Err(NativeError::UnknownTimer(id.get()));
        };

        if let Some(stop_tx) = timer.stop_tx.take() {
            let _ = stop_tx.try_send(()); // ask thread to exit
        }

        if let Some(handle) = timer.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join(); // wait for in-flight callback
            }
        }

        debug!("[timer {}] cancelled", id);
        Ok(())
    }

    fn name(&self) -> String {
        "thread".to_string()
    }
}
