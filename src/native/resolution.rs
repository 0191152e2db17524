use crate::error::NativeError;

/// Raises the system timer resolution for as long as it is held.
#[derive(Debug)]
pub struct ResolutionGuard {
    period_ms: u32,
}

impl ResolutionGuard {
    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }
}

#[cfg(windows)]
mod win_timer {
    use super::ResolutionGuard;
    use crate::error::NativeError;
    use winapi::um::timeapi;

    pub fn enable(period_ms: u32) -> Result<ResolutionGuard, NativeError> {
        // SAFETY: only adjusts the process timer period; paired with timeEndPeriod on drop.
        unsafe {
            if timeapi::timeBeginPeriod(period_ms) == winapi::um::mmsystem::TIMERR_NOERROR {
                Ok(ResolutionGuard { period_ms })
            } else {
                Err(NativeError::ResolutionRefused(period_ms))
            }
        }
    }

    pub fn disable(period_ms: u32) {
        // SAFETY: matches the timeBeginPeriod of the same period in `enable`.
        unsafe {
            timeapi::timeEndPeriod(period_ms);
        }
    }
}

#[cfg(not(windows))]
mod win_timer {
    use super::ResolutionGuard;
    use crate::error::NativeError;

    pub fn enable(period_ms: u32) -> Result<ResolutionGuard, NativeError> {
        if period_ms == 0 {
            return Err(NativeError::ResolutionRefused(period_ms));
        }
        Ok(ResolutionGuard { period_ms })
    }

    pub fn disable(_period_ms: u32) {}
}

impl ResolutionGuard {
    pub fn acquire(period_ms: u32) -> Result<Self, NativeError> {
        win_timer::enable(period_ms)
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        win_timer::disable(self.period_ms);
    }
}
