//! Virtual clock.
//!
//! Time is a logical millisecond counter that only moves when the scheduler
//! advances it. It never decreases.

use std::rc::Rc;

use crate::error::{Error, Result};

/// A monotonic millisecond time source.
pub trait Clock {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now_ms(&self) -> u64 {
        self.as_ref().now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Logical clock owned by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualClock {
    current_ms: u64,
}

impl VirtualClock {
    /// Create a clock starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { current_ms: 0 }
    }

    #[must_use]
    pub const fn now_ms(&self) -> u64 {
        self.current_ms
    }

    /// Move the clock forward to `target_ms`.
    ///
    /// Fails with [`Error::InvalidArgument`] if `target_ms` is in the past.
    pub fn advance_to(&mut self, target_ms: u64) -> Result<()> {
        if target_ms < self.current_ms {
            return Err(Error::invalid_argument(format!(
                "clock cannot move backwards from {} to {target_ms}",
                self.current_ms
            )));
        }
        self.current_ms = target_ms;
        Ok(())
    }

    /// Move the clock forward by `delta_ms`, saturating at `u64::MAX`.
    pub const fn advance_by(&mut self, delta_ms: u64) -> u64 {
        self.current_ms = self.current_ms.saturating_add(delta_ms);
        self.current_ms
    }

    pub(crate) const fn reset(&mut self) {
        self.current_ms = 0;
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.current_ms
    }
}
