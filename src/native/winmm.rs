use std::collections::HashMap;
use std::mem;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tracing::{debug, error};
use winapi::shared::basetsd::DWORD_PTR;
use winapi::shared::minwindef::UINT;
use winapi::um::mmsystem::{MMRESULT, TIMECAPS, TIMERR_NOERROR};
use winapi::um::timeapi;

use crate::error::{panic_message, NativeError};
use crate::native::{
    Capabilities, CapabilityCache, NativeCallback, NativeTimerService, TimerId, TimerMode,
};

const TIME_ONESHOT: UINT = 0x0000;
const TIME_PERIODIC: UINT = 0x0001;
const TIME_CALLBACK_FUNCTION: UINT = 0x0000;
const TIME_KILL_SYNCHRONOUS: UINT = 0x0100;

type TimeProc = unsafe extern "system" fn(UINT, UINT, DWORD_PTR, DWORD_PTR, DWORD_PTR);

#[link(name = "winmm")]
extern "system" {
    fn timeSetEvent(
        u_delay: UINT,
        u_resolution: UINT,
        lp_time_proc: TimeProc,
        dw_user: DWORD_PTR,
        fu_event: UINT,
    ) -> MMRESULT;
    fn timeKillEvent(u_timer_id: UINT) -> MMRESULT;
}

struct Registration {
    callback: NativeCallback,
    mode: TimerMode,
}

#[derive(Default)]
struct Registry {
    // Keyed by the user tag handed to timeSetEvent, so an entry exists before
    // the first callback can fire.
    by_tag: HashMap<usize, Registration>,
    // Live handles only; an expired one-shot leaves no entry behind.
    tags: HashMap<TimerId, usize>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));
static NEXT_TAG: AtomicUsize = AtomicUsize::new(1);

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|p| p.into_inner())
}

unsafe extern "system" fn timer_proc(
    u_timer_id: UINT,
    _u_msg: UINT,
    dw_user: DWORD_PTR,
    _dw1: DWORD_PTR,
    _dw2: DWORD_PTR,
) {
    // Unwinding into winmm aborts the process.
    let _ = panic::catch_unwind(|| on_fire(u_timer_id, dw_user));
}

fn on_fire(raw_id: u32, tag: usize) {
    let Some(id) = TimerId::new(raw_id) else {
        return;
    };
    let callback = {
        let mut registry = registry();
        match registry.by_tag.get(&tag).map(|r| r.mode) {
            Some(TimerMode::OneShot) => {
                registry.tags.remove(&id);
                registry.by_tag.remove(&tag).map(|r| r.callback)
            }
            Some(TimerMode::Periodic) => {
                registry.by_tag.get(&tag).map(|r| r.callback.clone())
            }
            // Cancelled or already fired; a late fire is absorbed.
            None => None,
        }
    };
    if let Some(callback) = callback {
        if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(|| callback(id))) {
            error!("[timer {}] callback panicked: {}", id, panic_message(&*payload));
        }
    }
}

/// Windows multimedia timer source (`timeSetEvent` / `timeKillEvent`).
pub struct WinmmTimerService {
    capabilities: CapabilityCache,
}

impl WinmmTimerService {
    pub fn new() -> Self {
        WinmmTimerService {
            capabilities: CapabilityCache::new(),
        }
    }
}

impl Default for WinmmTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeTimerService for WinmmTimerService {
    fn capabilities(&self) -> Result<Capabilities, NativeError> {
        self.capabilities.get_or_query(|| {
            let mut caps = TIMECAPS {
                wPeriodMin: 0,
                wPeriodMax: 0,
            };
            // SAFETY: caps is a valid TIMECAPS and the size passed matches it.
            let status = unsafe {
                timeapi::timeGetDevCaps(&mut caps, mem::size_of::<TIMECAPS>() as UINT)
            };
            if status != TIMERR_NOERROR {
                return Err(NativeError::Capabilities(status));
            }
            debug!(
                "winmm timer capabilities: {}..={} ms",
                caps.wPeriodMin, caps.wPeriodMax
            );
            Ok(Capabilities {
                period_min: caps.wPeriodMin,
                period_max: caps.wPeriodMax,
            })
        })
    }

    fn register(
        &self,
        period_ms: u32,
        resolution_ms: u32,
        mode: TimerMode,
        callback: NativeCallback,
    ) -> Result<TimerId, NativeError> {
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        registry().by_tag.insert(tag, Registration { callback, mode });

        let flags = match mode {
            TimerMode::OneShot => TIME_ONESHOT | TIME_CALLBACK_FUNCTION,
            TimerMode::Periodic => TIME_PERIODIC | TIME_CALLBACK_FUNCTION | TIME_KILL_SYNCHRONOUS,
        };
        // SAFETY: timer_proc is a 'static extern fn that never unwinds.
        let raw = unsafe { timeSetEvent(period_ms, resolution_ms, timer_proc, tag, flags) };

        match TimerId::new(raw) {
            Some(id) => {
                let mut registry = registry();
                // A short one-shot may have fired before timeSetEvent returned.
                if registry.by_tag.contains_key(&tag) {
                    registry.tags.insert(id, tag);
                }
                drop(registry);
                debug!("[timer {}] registered {:?} every {} ms", id, mode, period_ms);
                Ok(id)
            }
            None => {
                registry().by_tag.remove(&tag);
                Err(NativeError::RegistrationRefused {
                    period_ms,
                    resolution_ms,
                })
            }
        }
    }

    fn cancel(&self, id: TimerId) -> Result<(), NativeError> {
        // Unlinked first, so a fire racing the kill finds nothing to run.
        let registration = {
            let mut registry = registry();
            let tag = registry.tags.remove(&id);
            tag.and_then(|tag| registry.by_tag.remove(&tag))
        };
        // Expired or foreign handles are never killed; winmm may have reused them.
        let Some(registration) = registration else {
            return Err(NativeError::UnknownTimer(id.get()));
        };

        // SAFETY: plain FFI call on a handle this service registered. Not
        // under the registry lock: a synchronous kill waits for timer_proc.
        let status = unsafe { timeKillEvent(id.get()) };
        drop(registration);

        if status == TIMERR_NOERROR {
            debug!("[timer {}] cancelled", id);
            Ok(())
        } else {
            Err(NativeError::CancelRefused {
                id: id.get(),
                status,
            })
        }
    }

    fn name(&self) -> String {
        "winmm".to_string()
    }
}
