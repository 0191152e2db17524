use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;

use crate::error::{LastError, TimerError};

/// How long a native callback may wait for the previous tick to finish.
pub fn admission_window(period_ms: u32) -> Duration {
    Duration::from_millis(u64::from((period_ms / 2).max(1)))
}

/// Consistent counter snapshot; `events == ticks + missed` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub ticks: u64,
    pub missed: u64,
    pub events: u64,
}

/// Single-permit gate. The permit travels with the admitted tick and returns
/// to the gate when dropped, after that tick's dispatch finished.
struct AdmissionGate {
    release: Sender<()>,
    acquire: Receiver<()>,
}

impl AdmissionGate {
    fn new() -> Self {
        let (release, acquire) = bounded(1);
        let _ = release.try_send(());
        AdmissionGate { release, acquire }
    }

    fn try_acquire(&self, timeout: Duration) -> Option<AdmissionPermit> {
        self.acquire.recv_timeout(timeout).ok().map(|()| AdmissionPermit {
            release: self.release.clone(),
        })
    }

    fn drain(&self) {
        if self.acquire.recv().is_ok() {
            let _ = self.release.try_send(());
        }
    }
}

pub struct AdmissionPermit {
    release: Sender<()>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let _ = self.release.try_send(());
    }
}

pub struct AdmittedTick {
    /// `ticks + missed` recorded under the tick lock at admission.
    pub event_number: u64,
    pub missed: u64,
    pub permit: AdmissionPermit,
}

pub enum Admission {
    Admitted(AdmittedTick),
    Missed { missed: u64 },
    Failed,
}

#[derive(Default)]
struct TickCount {
    ticks: u64,
    events: u64,
}

/// Admission control and the authoritative tick counters.
///
/// Lock order is tick-count before missed-count wherever both are taken.
pub struct TickAccountant {
    ticks: Mutex<TickCount>,
    missed: Mutex<u64>,
    gate: AdmissionGate,
}

impl TickAccountant {
    pub fn new() -> Self {
        TickAccountant {
            ticks: Mutex::new(TickCount::default()),
            missed: Mutex::new(0),
            gate: AdmissionGate::new(),
        }
    }

    /// Decides the fate of one native callback. Never panics and never blocks
    /// longer than the admission window. A tick that cannot be admitted is
    /// counted as missed whenever the missed counter still can be.
    pub fn on_tick(&self, period_ms: u32, errors: &LastError) -> Admission {
        if let Some(permit) = self.gate.try_acquire(admission_window(period_ms)) {
            match self.admit() {
                Ok((event_number, missed)) => {
                    return Admission::Admitted(AdmittedTick {
                        event_number,
                        missed,
                        permit,
                    })
                }
                Err(e) => errors.record(&e),
            }
        }
        match self.miss() {
            Ok(missed) => Admission::Missed { missed },
            Err(e) => {
                errors.record(&e);
                Admission::Failed
            }
        }
    }

    /// Blocks until no admitted tick is being dispatched.
    pub fn drain(&self) {
        self.gate.drain();
    }

    // Counters are plain integers, so a poisoned lock still holds a valid value.
    fn admit(&self) -> Result<(u64, u64), TimerError> {
        let mut count = self.lock_ticks();
        let missed = *self.lock_missed();
        let ticks = count
            .ticks
            .checked_add(1)
            .ok_or_else(|| TimerError::Accounting("tick counter overflow".into()))?;
        let events = ticks
            .checked_add(missed)
            .ok_or_else(|| TimerError::Accounting("event counter overflow".into()))?;
        count.ticks = ticks;
        count.events = events;
        Ok((events, missed))
    }

    fn miss(&self) -> Result<u64, TimerError> {
        let mut missed = self.lock_missed();
        *missed = missed
            .checked_add(1)
            .ok_or_else(|| TimerError::Accounting("missed counter overflow".into()))?;
        Ok(*missed)
    }

    fn lock_ticks(&self) -> MutexGuard<'_, TickCount> {
        self.ticks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_missed(&self) -> MutexGuard<'_, u64> {
        self.missed.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn tick_counter(&self) -> u64 {
        self.lock_ticks().ticks
    }

    pub fn missed_counter(&self) -> u64 {
        *self.lock_missed()
    }

    /// Event number recorded by the most recent admission.
    pub fn last_event_number(&self) -> u64 {
        self.lock_ticks().events
    }

    pub fn stats(&self) -> TickStats {
        let count = self.lock_ticks();
        let missed = *self.lock_missed();
        TickStats {
            ticks: count.ticks,
            missed,
            events: count.ticks.saturating_add(missed),
        }
    }
}

impl Default for TickAccountant {
    fn default() -> Self {
        Self::new()
    }
}
