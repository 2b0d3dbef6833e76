//! Per-file timer: a single `timerfd`, reused for two unrelated purposes
//! (spec.md §5, "Cancellation and timeouts"): the 10 ms partial-read window
//! and the 1 s release-drain grace period. Arming one disarms the other,
//! since only one expiry can be pending on the fd at a time.
//!
//! Mirrors `timer_arm`/`timer_disarm` in `devfile.c`: `timerfd_settime` with
//! a zero `it_value` both disarms and clears any pending expiry count, so
//! no dummy read is needed after disarming.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::error::{Error, Result};

pub const PARTIAL_READ_DELAY: Duration = Duration::from_millis(10);
pub const RELEASE_DRAIN_DELAY: Duration = Duration::from_secs(1);

pub struct Timer {
    fd: TimerFd,
}

impl Timer {
    pub fn new() -> Result<Self> {
        let fd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .map_err(Error::Errno)?;
        Ok(Timer { fd })
    }

    pub fn arm(&self, delay: Duration) -> Result<()> {
        self.fd
            .set(
                Expiration::OneShot(delay.into()),
                TimerSetTimeFlags::empty(),
            )
            .map_err(Error::Errno)
    }

    pub fn disarm(&self) -> Result<()> {
        self.fd
            .set(Expiration::OneShot(Duration::ZERO.into()), TimerSetTimeFlags::empty())
            .map_err(Error::Errno)
    }

    /// Drains the expiry count. `Ok(None)` on a benign `EAGAIN` (the timer
    /// was disarmed earlier in this same epoll batch); `Ok(Some(ticks))`
    /// otherwise.
    pub fn read_ticks(&self) -> Result<Option<u64>> {
        match self.fd.wait() {
            Ok(ticks) => Ok(Some(ticks)),
            Err(nix::errno::Errno::EAGAIN) => Ok(None),
            Err(e) => Err(Error::Errno(e)),
        }
    }
}

impl AsRawFd for Timer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_then_disarm_does_not_error() {
        let timer = Timer::new().unwrap();
        timer.arm(PARTIAL_READ_DELAY).unwrap();
        timer.disarm().unwrap();
    }
}
