//! Mock timer service for testing
//!
//! Nothing fires on its own: tests drive callbacks with [`MockTimerService::fire`].
//! Registration and cancellation can be refused or made to panic to exercise
//! failure paths, and
//! callbacks of cancelled or expired registrations stay reachable through
//! [`MockTimerService::fire_retired`] to replay stray late fires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::error::NativeError;
use crate::native::{Capabilities, NativeCallback, NativeTimerService, TimerId, TimerMode};

#[derive(Clone)]
pub struct MockRegistration {
    pub id: TimerId,
    pub period_ms: u32,
    pub resolution_ms: u32,
    pub mode: TimerMode,
    callback: NativeCallback,
}

#[derive(Default)]
struct MockState {
    next_id: u32,
    active: HashMap<TimerId, MockRegistration>,
    retired: HashMap<TimerId, MockRegistration>,
    history: Vec<MockRegistration>,
    refuse_register: bool,
    refuse_cancel: Option<u32>,
    panic_register: bool,
    panic_cancel: bool,
    one_shot_delay: Option<Duration>,
    cancels: usize,
}

pub struct MockTimerService {
    capabilities: Capabilities,
    state: Mutex<MockState>,
}

impl MockTimerService {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities {
            period_min: 1,
            period_max: 1_000_000,
        })
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        MockTimerService {
            capabilities,
            state: Mutex::new(MockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes `register` return the "no timer created" failure.
    pub fn refuse_registration(&self, refuse: bool) {
        self.lock().refuse_register = refuse;
    }

    /// Makes `cancel` fail with the given native status code.
    pub fn refuse_cancel(&self, status: Option<u32>) {
        self.lock().refuse_cancel = status;
    }

    /// Makes `register` and `cancel` panic instead of returning.
    pub fn panic_on_register(&self, panic: bool) {
        self.lock().panic_register = panic;
    }

    pub fn panic_on_cancel(&self, panic: bool) {
        self.lock().panic_cancel = panic;
    }

    /// Fires every later one-shot registration from a helper thread after `delay`.
    pub fn fire_one_shots_after(&self, delay: Option<Duration>) {
        self.lock().one_shot_delay = delay;
    }

    /// Invokes the callback of an active registration on the calling thread.
    /// A one-shot registration expires after firing.
    pub fn fire(&self, id: TimerId) -> bool {
        let callback = {
            let mut state = self.lock();
            let Some(registration) = state.active.get(&id).cloned() else {
                return false;
            };
            if registration.mode == TimerMode::OneShot {
                state.active.remove(&id);
                state.retired.insert(id, registration.clone());
            }
            registration.callback
        };
        callback(id);
        true
    }

    /// Invokes the callback of a cancelled or expired registration.
    pub fn fire_retired(&self, id: TimerId) -> bool {
        let callback = self.lock().retired.get(&id).map(|r| r.callback.clone());
        match callback {
            Some(callback) => {
                callback(id);
                true
            }
            None => false,
        }
    }

    pub fn active_ids(&self) -> Vec<TimerId> {
        let mut ids: Vec<_> = self.lock().active.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn last_registration(&self) -> Option<MockRegistration> {
        self.lock().history.last().cloned()
    }

    pub fn registration_count(&self) -> usize {
        self.lock().history.len()
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancels
    }
}

impl Default for MockTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeTimerService for MockTimerService {
    fn capabilities(&self) -> Result<Capabilities, NativeError> {
        Ok(self.capabilities)
    }

    fn register(
        &self,
        period_ms: u32,
        resolution_ms: u32,
        mode: TimerMode,
        callback: NativeCallback,
    ) -> Result<TimerId, NativeError> {
        if self.lock().panic_register {
            panic!("mock register exploded");
        }
        let mut state = self.lock();
        if state.refuse_register {
            return Err(NativeError::RegistrationRefused {
                period_ms,
                resolution_ms,
            });
        }

        state.next_id += 1;
        let id = TimerId::new(state.next_id).ok_or(NativeError::RegistrationRefused {
            period_ms,
            resolution_ms,
        })?;
        let registration = MockRegistration {
            id,
            period_ms,
            resolution_ms,
            mode,
            callback: callback.clone(),
        };
        state.active.insert(id, registration.clone());
        state.history.push(registration);

        if let (TimerMode::OneShot, Some(delay)) = (mode, state.one_shot_delay) {
            thread::spawn(move || {
                thread::sleep(delay);
                callback(id);
            });
        }
        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> Result<(), NativeError> {
        let mut state = self.lock();
        state.cancels += 1;
        if state.panic_cancel {
            drop(state);
            panic!("mock cancel exploded");
        }
        if let Some(status) = state.refuse_cancel {
            return Err(NativeError::CancelRefused {
                id: id.get(),
                status,
            });
        }
        match state.active.remove(&id) {
            Some(registration) => {
                state.retired.insert(id, registration);
                Ok(())
            }
            None => Err(NativeError::UnknownTimer(id.get())),
        }
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (NativeCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (
            Arc::new(move |_| {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_fire_only_reaches_active_registrations() {
        let mock = MockTimerService::new();
        let (callback, count) = counter();
        let id = mock.register(10, 1, TimerMode::Periodic, callback).unwrap();

        assert!(mock.fire(id));
        assert!(mock.fire(id));
        mock.cancel(id).unwrap();
        assert!(!mock.fire(id));
        assert!(mock.fire_retired(id));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_one_shot_expires_after_first_fire() {
        let mock = MockTimerService::new();
        let (callback, count) = counter();
        let id = mock.register(10, 1, TimerMode::OneShot, callback).unwrap();

        assert!(mock.fire(id));
        assert!(!mock.fire(id));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(mock.cancel(id), Err(NativeError::UnknownTimer(id.get())));
    }

    #[test]
    fn test_refusals() {
        let mock = MockTimerService::new();
        let (callback, _) = counter();

        mock.refuse_registration(true);
        assert!(mock
            .register(10, 1, TimerMode::Periodic, callback.clone())
            .is_err());
        mock.refuse_registration(false);

        let id = mock.register(10, 1, TimerMode::Periodic, callback).unwrap();
        mock.refuse_cancel(Some(5));
        assert_eq!(
            mock.cancel(id),
            Err(NativeError::CancelRefused {
                id: id.get(),
                status: 5
            })
        );
        assert_eq!(mock.active_ids(), vec![id]);
        assert_eq!(mock.cancel_count(), 1);
    }

    #[test]
    fn test_panic_modes() {
        let mock = MockTimerService::new();
        let (callback, _) = counter();

        mock.panic_on_register(true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mock.register(10, 1, TimerMode::Periodic, callback.clone())
        }));
        assert!(result.is_err());
        mock.panic_on_register(false);

        let id = mock.register(10, 1, TimerMode::Periodic, callback).unwrap();
        mock.panic_on_cancel(true);
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mock.cancel(id))).is_err());
        mock.panic_on_cancel(false);
        assert!(mock.cancel(id).is_ok());
    }
}
