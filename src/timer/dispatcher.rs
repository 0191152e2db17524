use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::{panic_message, LastError, TimerError};
use crate::native::TimerId;
use crate::timer::accountant::AdmissionPermit;

/// Direct callback: `(timer_id, event_number, timestamp)`.
pub type TickCallback = Arc<dyn Fn(TimerId, u64, DateTime<Utc>) -> Result<(), String> + Send + Sync>;

pub type TickSubscriber = Arc<dyn Fn(&TickEvent) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickEvent {
    pub timer_id: TimerId,
    pub tick_number: u64,
    pub missed_ticks: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
enum Subscriber {
    Handler(TickSubscriber),
    Channel(Sender<TickEvent>),
}

/// Runs the direct callback, then every subscriber in registration order.
pub struct Dispatcher {
    callback: Option<TickCallback>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Dispatcher {
    pub fn new(callback: Option<TickCallback>) -> Self {
        Dispatcher {
            callback,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: TickSubscriber) {
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber::Handler(subscriber));
    }

    pub fn subscribe_channel(&self) -> Receiver<TickEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber::Channel(tx));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Returns the number of failed handlers. Each failure is recorded and the
    /// remaining handlers still run.
    pub fn dispatch(&self, event: &TickEvent, errors: &LastError) -> usize {
        let mut failures = 0;

        if let Some(callback) = &self.callback {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                callback(event.timer_id, event.tick_number, event.timestamp)
            }));
            if let Some(msg) = failure_message(result) {
                failures += 1;
                self.report(errors, format!("tick callback: {}", msg), event);
            }
        }

        // Snapshot so handlers may subscribe without deadlocking.
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let mut disconnected = Vec::new();

        for (index, subscriber) in subscribers.iter().enumerate() {
            match subscriber {
                Subscriber::Handler(handler) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
                    if let Some(msg) = failure_message(result) {
                        failures += 1;
                        self.report(errors, format!("subscriber {}: {}", index, msg), event);
                    }
                }
                Subscriber::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        disconnected.push(tx.clone());
                    }
                }
            }
        }

        if !disconnected.is_empty() {
            self.subscribers
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|s| match s {
                    Subscriber::Channel(tx) => !disconnected.iter().any(|d| d.same_channel(tx)),
                    Subscriber::Handler(_) => true,
                });
            trace!("pruned {} closed tick channels", disconnected.len());
        }

        failures
    }

    fn report(&self, errors: &LastError, msg: String, event: &TickEvent) {
        warn!("[timer {}] tick {} {}", event.timer_id, event.tick_number, msg);
        errors.record(&TimerError::Dispatch(msg));
    }
}

fn failure_message(result: thread::Result<Result<(), String>>) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(msg)) => Some(msg),
        Err(payload) => Some(format!("panicked: {}", panic_message(&*payload))),
    }
}

pub struct DispatchJob {
    pub event: TickEvent,
    pub permit: AdmissionPermit,
}

/// Spawns the thread that dispatches admitted ticks off the native callback
/// thread. It exits once every job sender is dropped.
pub fn spawn_worker(
    name: String,
    jobs: Receiver<DispatchJob>,
    dispatcher: Arc<Dispatcher>,
    errors: Arc<LastError>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(move || {
        for DispatchJob { event, permit } in jobs.iter() {
            dispatcher.dispatch(&event, &errors);
            // Next tick may be admitted once this one is fully dispatched.
            drop(permit);
        }
    })
}
