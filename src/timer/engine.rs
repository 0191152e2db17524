use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::config::TimerConfig;
use crate::error::{panic_message, LastError, NativeError, TimerError};
use crate::native::resolution::ResolutionGuard;
use crate::native::{system_service, NativeCallback, NativeTimerService, TimerId, TimerMode};
use crate::timer::accountant::{Admission, TickAccountant, TickStats};
use crate::timer::dispatcher::{
    spawn_worker, DispatchJob, Dispatcher, TickCallback, TickEvent, TickSubscriber,
};
use crate::timer::wait_gate::WaitGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Idle,
    Running,
}

/// State touched from the native callback thread.
struct Shared {
    period_ms: u32,
    mode: TimerMode,
    accountant: TickAccountant,
    errors: Arc<LastError>,
    dispatcher: Arc<Dispatcher>,
    jobs: Sender<DispatchJob>,
    worker: ThreadId,
    // Bumped by every start and stop; callbacks of older registrations are ignored.
    generation: AtomicU64,
    fired: AtomicBool,
}

impl Shared {
    fn on_native_tick(&self, id: TimerId, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            trace!("[timer {}] ignoring callback of a stale registration", id);
            return;
        }
        if self.mode == TimerMode::OneShot && self.fired.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.accountant.on_tick(self.period_ms, &self.errors) {
            Admission::Admitted(tick) => {
                let event = TickEvent {
                    timer_id: id,
                    tick_number: tick.event_number,
                    missed_ticks: tick.missed,
                    timestamp: Utc::now(),
                };
                trace!("[timer {}] tick {} admitted", id, event.tick_number);
                let job = DispatchJob {
                    event,
                    permit: tick.permit,
                };
                if self.jobs.send(job).is_err() {
                    self.errors.record(&TimerError::Dispatch(
                        "dispatch worker is not running".into(),
                    ));
                }
            }
            Admission::Missed { missed } => {
                warn!("[timer {}] tick dropped, {} missed so far", id, missed);
            }
            Admission::Failed => {}
        }
    }
}

fn native_callback(shared: Weak<Shared>, generation: u64) -> NativeCallback {
    Arc::new(move |id| {
        // The timer may already be gone; a late fire is absorbed.
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.on_native_tick(id, generation)
        }));
        if let Err(payload) = result {
            shared.errors.record(&TimerError::Accounting(panic_message(&*payload)));
        }
    })
}

struct Lifecycle {
    state: TimerState,
    id: Option<TimerId>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    resolution: Option<ResolutionGuard>,
}

/// Event-driven periodic or one-shot timer.
///
/// Counters survive `stop` and accumulate across restarts for the lifetime of
/// the instance. Dropping a running timer stops it.
pub struct Timer {
    config: TimerConfig,
    service: Arc<dyn NativeTimerService>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

pub struct TimerBuilder {
    config: TimerConfig,
    callback: Option<TickCallback>,
    subscribers: Vec<TickSubscriber>,
    service: Option<Arc<dyn NativeTimerService>>,
}

impl TimerBuilder {
    pub fn new(config: TimerConfig) -> Self {
        TimerBuilder {
            config,
            callback: None,
            subscribers: Vec::new(),
            service: None,
        }
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TimerId, u64, DateTime<Utc>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Subscribers registered here see the very first tick of an auto-started timer.
    pub fn subscriber<F>(mut self, subscriber: F) -> Self
    where
        F: Fn(&TickEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.subscribers.push(Arc::new(subscriber));
        self
    }

    /// Defaults to [`system_service`].
    pub fn service(mut self, service: Arc<dyn NativeTimerService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn build(self) -> Result<Timer, TimerError> {
        let service = self.service.unwrap_or_else(system_service);
        let caps = service.capabilities().map_err(|e| {
            TimerError::Configuration(format!("{} timer capabilities: {}", service.name(), e))
        })?;
        self.config.validate(&caps)?;

        let errors = Arc::new(LastError::default());
        let dispatcher = Arc::new(Dispatcher::new(self.callback));
        for subscriber in self.subscribers {
            dispatcher.subscribe(subscriber);
        }

        let (jobs, job_rx): (Sender<DispatchJob>, Receiver<DispatchJob>) = unbounded();
        let worker = spawn_worker(
            format!("mmtimer-dispatch-{}ms", self.config.period_ms),
            job_rx,
            dispatcher.clone(),
            errors.clone(),
        )
        .map_err(|e| TimerError::Initialization(format!("dispatch worker: {}", e)))?
        .thread()
        .id();

        let timer = Timer {
            shared: Arc::new(Shared {
                period_ms: self.config.period_ms,
                mode: self.config.mode,
                accountant: TickAccountant::new(),
                errors,
                dispatcher,
                jobs,
                worker,
                generation: AtomicU64::new(0),
                fired: AtomicBool::new(false),
            }),
            config: self.config,
            service,
            lifecycle: Mutex::new(Lifecycle {
                state: TimerState::Idle,
                id: None,
                started_at: None,
                stopped_at: None,
                resolution: None,
            }),
        };

        if timer.config.auto_start && !timer.start() {
            return Err(TimerError::Initialization(timer.last_error()));
        }
        Ok(timer)
    }
}

impl Timer {
    pub fn new(config: TimerConfig) -> Result<Self, TimerError> {
        TimerBuilder::new(config).build()
    }

    pub fn builder(config: TimerConfig) -> TimerBuilder {
        TimerBuilder::new(config)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers with the native service. Returns `false` and records the
    /// failure when no timer was created. Starting a running timer is a no-op.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state == TimerState::Running {
            return true;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.fired.store(false, Ordering::Release);
        let callback = native_callback(Arc::downgrade(&self.shared), generation);

        let TimerConfig {
            period_ms,
            resolution_ms,
            mode,
            ..
        } = self.config;
        let service = &self.service;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            service.register(period_ms, resolution_ms, mode, callback)
        }))
        .unwrap_or_else(|payload| Err(NativeError::Panicked(panic_message(&*payload))));

        match result {
            Ok(id) => {
                lifecycle.state = TimerState::Running;
                lifecycle.id = Some(id);
                lifecycle.started_at = Some(Instant::now());
                lifecycle.stopped_at = None;
                if resolution_ms > 0 {
                    lifecycle.resolution = ResolutionGuard::acquire(resolution_ms)
                        .map_err(|e| warn!("[timer {}] {}", id, e))
                        .ok();
                }
                debug!(
                    "[timer {}] started {:?} every {} ms on {}",
                    id,
                    mode,
                    period_ms,
                    self.service.name()
                );
                true
            }
            Err(e) => {
                self.shared.generation.fetch_add(1, Ordering::AcqRel);
                error!("timer start failed: {}", e);
                self.shared.errors.record(&TimerError::StartFailure(e));
                false
            }
        }
    }

    /// Cancels the native registration and returns once the tick being
    /// dispatched, if any, has finished. The timer is `Idle` afterwards even
    /// when cancellation reports a failure, in which case `false` is returned.
    ///
    /// Called from a callback or subscriber, it does not wait for that dispatch.
    pub fn stop(&self) -> bool {
        let (id, result) = {
            let mut lifecycle = self.lock_lifecycle();
            let Some(id) = lifecycle.id.take() else {
                lifecycle.state = TimerState::Idle;
                return true;
            };

            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            let service = &self.service;
            let result = panic::catch_unwind(AssertUnwindSafe(|| service.cancel(id)))
                .unwrap_or_else(|payload| Err(NativeError::Panicked(panic_message(&*payload))));

            lifecycle.state = TimerState::Idle;
            lifecycle.stopped_at = Some(Instant::now());
            lifecycle.resolution = None;
            (id, result)
        };

        // Handlers may read the lifecycle, so drain outside its lock.
        if thread::current().id() != self.shared.worker {
            self.shared.accountant.drain();
        }

        match result {
            Ok(()) => {
                debug!("[timer {}] stopped", id);
                true
            }
            // An expired one-shot registration is already gone.
            Err(NativeError::UnknownTimer(_)) if self.config.mode == TimerMode::OneShot => {
                debug!("[timer {}] one-shot already expired", id);
                true
            }
            Err(e) => {
                error!("[timer {}] stop failed: {}", id, e);
                self.shared.errors.record(&TimerError::StopFailure(e));
                false
            }
        }
    }

    /// Blocks for `duration_ms` using a one-shot native timer. Returns `false`
    /// on timeout or failure; failures are recorded in [`Timer::last_error`].
    pub fn wait(&self, duration_ms: u32) -> bool {
        match self.wait_gate().wait(duration_ms) {
            Ok(fired) => fired,
            Err(e) => {
                self.shared.errors.record(&e);
                false
            }
        }
    }

    pub fn wait_gate(&self) -> WaitGate {
        WaitGate::new(self.service.clone())
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&TickEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(Arc::new(subscriber));
    }

    pub fn subscribe_channel(&self) -> Receiver<TickEvent> {
        self.shared.dispatcher.subscribe_channel()
    }

    pub fn tick_counter(&self) -> u64 {
        self.shared.accountant.tick_counter()
    }

    pub fn missed_tick_counter(&self) -> u64 {
        self.shared.accountant.missed_counter()
    }

    pub fn event_counter(&self) -> u64 {
        self.stats().events
    }

    pub fn stats(&self) -> TickStats {
        self.shared.accountant.stats()
    }

    pub fn last_error(&self) -> String {
        self.shared.errors.get()
    }

    pub fn state(&self) -> TimerState {
        self.lock_lifecycle().state
    }

    pub fn id(&self) -> Option<TimerId> {
        self.lock_lifecycle().id
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn period_ms(&self) -> u32 {
        self.config.period_ms
    }

    pub fn mode(&self) -> TimerMode {
        self.config.mode
    }

    /// Time since the latest start, or the length of the last run once stopped.
    pub fn elapsed(&self) -> Option<Duration> {
        let lifecycle = self.lock_lifecycle();
        let started = lifecycle.started_at?;
        let end = lifecycle.stopped_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.stop() {
            warn!("timer dropped with a failed cancellation: {}", self.last_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockTimerService;
    use crate::native::Capabilities;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

    fn mock_timer(config: TimerConfig) -> (Arc<MockTimerService>, Timer) {
        let mock = Arc::new(MockTimerService::new());
        let timer = Timer::builder(config)
            .service(mock.clone())
            .build()
            .unwrap();
        (mock, timer)
    }

    #[test]
    fn start_and_stop_drive_state_and_id() {
        let (mock, timer) = mock_timer(TimerConfig::periodic(100).with_auto_start(false));
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.id(), None);

        assert!(timer.start());
        assert_eq!(timer.state(), TimerState::Running);
        let id = timer.id().unwrap();
        assert_eq!(mock.active_ids(), vec![id]);

        // Already running: no second registration.
        assert!(timer.start());
        assert_eq!(mock.registration_count(), 1);

        assert!(timer.stop());
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.id(), None);
        assert!(mock.active_ids().is_empty());
        assert!(timer.stop());
        assert_eq!(timer.last_error(), "");
    }

    #[test]
    fn periodic_registration_uses_configured_values() {
        let (mock, _timer) = mock_timer(TimerConfig::periodic(5).with_resolution(1));
        let registration = mock.last_registration().unwrap();
        assert_eq!(registration.period_ms, 5);
        assert_eq!(registration.resolution_ms, 1);
        assert_eq!(registration.mode, TimerMode::Periodic);
    }

    #[test]
    fn refused_registration_records_error_and_stays_idle() {
        let mock = Arc::new(MockTimerService::new());
        mock.refuse_registration(true);
        let timer = Timer::builder(TimerConfig::periodic(100).with_auto_start(false))
            .service(mock.clone())
            .build()
            .unwrap();

        assert!(!timer.start());
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.id(), None);
        assert!(timer.last_error().contains("no timer created"));
    }

    #[test]
    fn auto_start_failure_fails_construction() {
        let mock = Arc::new(MockTimerService::new());
        mock.refuse_registration(true);
        let result = Timer::builder(TimerConfig::periodic(100))
            .service(mock)
            .build();
        match result {
            Err(TimerError::Initialization(msg)) => assert!(msg.contains("no timer created")),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("construction should fail"),
        }
    }

    #[test]
    fn out_of_range_config_is_rejected_at_construction() {
        let mock = Arc::new(MockTimerService::with_capabilities(Capabilities {
            period_min: 5,
            period_max: 50,
        }));
        for config in [
            TimerConfig::periodic(4),
            TimerConfig::periodic(51),
            TimerConfig::periodic(10).with_resolution(60),
        ] {
            let result = Timer::builder(config).service(mock.clone()).build();
            assert!(matches!(result, Err(TimerError::Configuration(_))));
        }
        assert_eq!(mock.registration_count(), 0);
    }

    #[test]
    fn refused_cancel_returns_false_but_goes_idle() {
        let (mock, timer) = mock_timer(TimerConfig::periodic(100));
        mock.refuse_cancel(Some(97));

        assert!(!timer.stop());
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.id(), None);
        assert!(timer.last_error().contains("status 97"));

        mock.refuse_cancel(None);
        assert!(timer.start());
    }

    #[test]
    fn admitted_ticks_are_dispatched_and_counted() {
        let (mock, timer) = mock_timer(TimerConfig::periodic(100));
        let events = timer.subscribe_channel();
        let id = timer.id().unwrap();

        for expected in 1..=3 {
            assert!(mock.fire(id));
            let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
            assert_eq!(event.timer_id, id);
            assert_eq!(event.tick_number, expected);
            assert_eq!(event.missed_ticks, 0);
        }
        assert_eq!(timer.tick_counter(), 3);
        assert_eq!(timer.missed_tick_counter(), 0);
        assert_eq!(timer.event_counter(), 3);
    }

    #[test]
    fn slow_dispatch_drops_the_next_tick_not_the_current_one() {
        let (started_tx, started_rx) = crossbeam_channel::bounded::<u64>(4);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(4);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<u64>(4);
        let mock = Arc::new(MockTimerService::new());
        let timer = Timer::builder(TimerConfig::periodic(100))
            .service(mock.clone())
            .subscriber(move |event| {
                let _ = started_tx.send(event.tick_number);
                let _ = release_rx.recv();
                let _ = done_tx.send(event.tick_number);
                Ok(())
            })
            .build()
            .unwrap();
        let id = timer.id().unwrap();

        mock.fire(id);
        assert_eq!(started_rx.recv_timeout(EVENT_TIMEOUT).unwrap(), 1);

        // Tick 1 is still being dispatched.
        mock.fire(id);
        assert_eq!(timer.tick_counter(), 1);
        assert_eq!(timer.missed_tick_counter(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(done_rx.recv_timeout(EVENT_TIMEOUT).unwrap(), 1);

        mock.fire(id);
        assert_eq!(started_rx.recv_timeout(EVENT_TIMEOUT).unwrap(), 3);
        release_tx.send(()).unwrap();
        assert_eq!(done_rx.recv_timeout(EVENT_TIMEOUT).unwrap(), 3);

        let stats = timer.stats();
        assert_eq!((stats.ticks, stats.missed, stats.events), (2, 1, 3));
    }

    #[test]
    fn failing_callback_keeps_tick_admitted() {
        let mock = Arc::new(MockTimerService::new());
        let timer = Timer::builder(TimerConfig::periodic(100))
            .service(mock.clone())
            .callback(|_, _, _| Err("callback refused".to_string()))
            .build()
            .unwrap();
        let events = timer.subscribe_channel();

        mock.fire(timer.id().unwrap());
        events.recv_timeout(EVENT_TIMEOUT).unwrap();

        assert_eq!(timer.tick_counter(), 1);
        assert_eq!(timer.missed_tick_counter(), 0);
        assert!(timer.last_error().contains("callback refused"));
    }

    #[test]
    fn panicking_subscriber_does_not_block_later_subscriber() {
        let mock = Arc::new(MockTimerService::new());
        let timer = Timer::builder(TimerConfig::periodic(100))
            .service(mock.clone())
            .subscriber(|_| -> Result<(), String> { panic!("first subscriber failed") })
            .build()
            .unwrap();
        let events = timer.subscribe_channel();

        mock.fire(timer.id().unwrap());
        assert_eq!(events.recv_timeout(EVENT_TIMEOUT).unwrap().tick_number, 1);
        assert!(timer.last_error().contains("first subscriber failed"));
        assert_eq!(timer.tick_counter(), 1);
    }

    #[test]
    fn one_shot_admits_at_most_one_tick_per_start() {
        let (mock, timer) = mock_timer(TimerConfig::one_shot(100));
        let events = timer.subscribe_channel();
        let first = timer.id().unwrap();

        assert!(mock.fire(first));
        events.recv_timeout(EVENT_TIMEOUT).unwrap();
        // Stray duplicate from the native layer.
        assert!(mock.fire_retired(first));
        assert_eq!(timer.tick_counter(), 1);

        // Expired one-shot: cancel reports an unknown timer, stop still succeeds.
        assert!(timer.stop());
        assert!(mock.fire_retired(first));
        assert_eq!(timer.event_counter(), 1);

        assert!(timer.start());
        let second = timer.id().unwrap();
        assert_ne!(first, second);
        assert!(mock.fire(second));
        events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(timer.tick_counter(), 2);
        assert_eq!(timer.missed_tick_counter(), 0);
    }

    #[test]
    fn callbacks_after_stop_are_not_counted_and_counters_persist() {
        let (mock, timer) = mock_timer(TimerConfig::periodic(100));
        let events = timer.subscribe_channel();
        let id = timer.id().unwrap();

        mock.fire(id);
        events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert!(timer.stop());

        assert!(mock.fire_retired(id));
        assert_eq!(timer.tick_counter(), 1);
        assert_eq!(timer.stats().events, 1);
        assert!(timer.elapsed().is_some());
    }

    #[test]
    fn late_fire_after_drop_is_absorbed() {
        let (mock, timer) = mock_timer(TimerConfig::periodic(100));
        let id = timer.id().unwrap();
        drop(timer);

        assert_eq!(mock.cancel_count(), 1);
        assert!(mock.fire_retired(id));
    }

    #[test]
    fn stop_returns_after_the_running_subscriber_finished() {
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let mock = Arc::new(MockTimerService::new());
        let timer = Timer::builder(TimerConfig::periodic(100))
            .service(mock.clone())
            .subscriber(move |_| {
                let _ = started_tx.try_send(());
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();

        mock.fire(timer.id().unwrap());
        started_rx.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert!(timer.stop());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_from_a_subscriber_does_not_wait_for_itself() {
        let slot: Arc<once_cell::sync::OnceCell<Weak<Timer>>> = Arc::default();
        let (stopped_tx, stopped_rx) = crossbeam_channel::bounded::<bool>(1);
        let mock = Arc::new(MockTimerService::new());
        let target = slot.clone();
        let timer = Arc::new(
            Timer::builder(TimerConfig::periodic(100))
                .service(mock.clone())
                .subscriber(move |_| {
                    if let Some(timer) = target.get().and_then(Weak::upgrade) {
                        let _ = stopped_tx.try_send(timer.stop());
                    }
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let _ = slot.set(Arc::downgrade(&timer));

        mock.fire(timer.id().unwrap());
        assert!(stopped_rx.recv_timeout(EVENT_TIMEOUT).unwrap());
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.tick_counter(), 1);
    }

    #[test]
    fn panicking_service_fails_start_and_stop_without_unwinding() {
        let mock = Arc::new(MockTimerService::new());
        mock.panic_on_register(true);
        let result = Timer::builder(TimerConfig::periodic(100))
            .service(mock.clone())
            .build();
        match result {
            Err(TimerError::Initialization(msg)) => {
                assert!(msg.contains("panicked: mock register exploded"))
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("construction should fail"),
        }

        let timer = Timer::builder(TimerConfig::periodic(100).with_auto_start(false))
            .service(mock.clone())
            .build()
            .unwrap();
        assert!(!timer.start());
        assert_eq!(timer.state(), TimerState::Idle);
        assert!(timer.last_error().contains("mock register exploded"));

        mock.panic_on_register(false);
        assert!(timer.start());
        mock.panic_on_cancel(true);
        assert!(!timer.stop());
        assert_eq!(timer.state(), TimerState::Idle);
        assert_eq!(timer.id(), None);
        assert!(timer.last_error().contains("mock cancel exploded"));
    }

    #[test]
    fn wait_records_failure_and_returns_false() {
        let (mock, timer) = mock_timer(TimerConfig::periodic(100).with_auto_start(false));
        assert!(!timer.wait(5));
        assert_eq!(timer.last_error(), "");

        mock.refuse_registration(true);
        assert!(!timer.wait(5));
        assert!(timer.last_error().contains("no timer created"));

        mock.refuse_registration(false);
        mock.fire_one_shots_after(Some(Duration::from_millis(1)));
        assert!(timer.wait(20));
    }
}
