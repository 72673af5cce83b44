//! Deadline waits for the cyclic thread.
//!
//! The three [`TimerStrategy`] variants differ only in how they wait for
//! the next deadline; the cycle body is the same for all of them.

use crossbeam_utils::Backoff;
use emem_common::config::TimerStrategy;
use std::thread;
use std::time::{Duration, Instant};

/// Block the calling thread until `deadline`.
pub fn wait_until(strategy: TimerStrategy, deadline: Instant) {
    match strategy {
        TimerStrategy::BusyWait => busy_wait(deadline),
        TimerStrategy::Sleep => sleep_until(deadline),
        TimerStrategy::NativeTimer => native_wait(deadline),
    }
}

fn busy_wait(deadline: Instant) {
    let backoff = Backoff::new();
    while Instant::now() < deadline {
        backoff.spin();
    }
}

fn sleep_until(deadline: Instant) {
    if let Some(rest) = deadline.checked_duration_since(Instant::now()) {
        thread::sleep(rest);
    }
}

/// Absolute-deadline sleep on `CLOCK_MONOTONIC`, the clock `Instant` reads.
#[cfg(target_os = "linux")]
fn native_wait(deadline: Instant) {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};

    let Some(rest) = deadline.checked_duration_since(Instant::now()) else {
        return;
    };
    let Ok(now) = clock_gettime(ClockId::CLOCK_MONOTONIC) else {
        sleep_until(deadline);
        return;
    };
    let target = now + TimeSpec::from(rest);
    while let Err(Errno::EINTR) =
        clock_nanosleep(ClockId::CLOCK_MONOTONIC, ClockNanosleepFlags::TIMER_ABSTIME, &target)
    {}
}

#[cfg(not(target_os = "linux"))]
fn native_wait(deadline: Instant) {
    sleep_until(deadline);
}

/// Fixed-period deadline tracker.
#[derive(Debug)]
pub struct CycleTimer {
    strategy: TimerStrategy,
    period: Duration,
    next: Instant,
    skipped: u64,
}

impl CycleTimer {
    /// First deadline is one period from now.
    #[must_use]
    pub fn new(strategy: TimerStrategy, period: Duration) -> Self {
        Self {
            strategy,
            period,
            next: Instant::now() + period,
            skipped: 0,
        }
    }

    /// Wait for the next deadline.
    ///
    /// Deadlines that already passed are dropped rather than run back to
    /// back; returns `true` when that happened.
    pub fn wait(&mut self) -> bool {
        wait_until(self.strategy, self.next);
        self.next += self.period;
        let now = Instant::now();
        if self.next <= now {
            let behind = now.duration_since(self.next).as_nanos() / self.period.as_nanos().max(1);
            self.skipped += u64::try_from(behind).unwrap_or(u64::MAX).saturating_add(1);
            self.next = now + self.period;
            return true;
        }
        false
    }

    /// Deadlines dropped so far.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Configured period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}
