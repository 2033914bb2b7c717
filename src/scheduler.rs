//! Absolute-deadline periodic execution.
//!
//! The wake time is read from `CLOCK_MONOTONIC` once, when the loop is armed,
//! and from then on only ever advanced by whole periods. The task sleeps until
//! that absolute time, so a long-running body eats into its own sleep instead
//! of shifting every later cycle. If the deadline has already passed the
//! sleep returns at once; periods are never skipped and the body is never run
//! twice to catch up.

use crate::error::SetupError;
use crate::utils::{mono_time_ns, to_timespec, Samples};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default number of lateness samples kept by [`Scheduler::run`].
pub const DEFAULT_HISTORY: usize = 4096;

/// Longest accepted cycle period.
pub const MAX_PERIOD: Duration = Duration::from_secs(3600);

/// Next wake time and period of a periodic task.
///
/// Passed into and returned from every step; nothing else keeps timing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodState {
    next_wake_ns: u64,
    period_ns: u64,
}

impl PeriodState {
    /// Arms a period starting now.
    pub fn arm(period: Duration) -> Result<Self, SetupError> {
        Self::starting_at(mono_time_ns(), period)
    }

    /// Arms a period whose first wake time is `next_wake_ns` on the
    /// monotonic clock.
    ///
    /// # Errors
    ///
    /// The period must be non-zero and at most [`MAX_PERIOD`], and the wake
    /// time one period ahead must still be representable.
    pub fn starting_at(next_wake_ns: u64, period: Duration) -> Result<Self, SetupError> {
        let period_ns = check_period(period)?;
        if next_wake_ns.checked_add(period_ns).is_none() {
            return Err(SetupError::Config(format!(
                "wake time {} ns plus period {:?} overflows the monotonic clock",
                next_wake_ns, period
            )));
        }
        Ok(Self {
            next_wake_ns,
            period_ns,
        })
    }

    #[inline(always)]
    pub fn next_wake_ns(&self) -> u64 {
        self.next_wake_ns
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns)
    }

    /// Moves the wake time one period forward.
    ///
    /// Saturates at `u64::MAX` ns, which the monotonic clock does not reach
    /// within centuries of uptime.
    #[must_use]
    #[inline(always)]
    pub fn advance(self) -> Self {
        Self {
            next_wake_ns: self.next_wake_ns.saturating_add(self.period_ns),
            ..self
        }
    }
}

/// Validates a cycle period and returns it in ns.
pub fn check_period(period: Duration) -> Result<u64, SetupError> {
    if period.is_zero() {
        return Err(SetupError::ZeroPeriod);
    }
    if period > MAX_PERIOD {
        return Err(SetupError::Config(format!(
            "period {:?} exceeds the maximum of {:?}",
            period, MAX_PERIOD
        )));
    }
    Ok(period.as_nanos() as u64)
}

/// Blocks until the monotonic clock reaches `deadline_ns`.
///
/// Returns immediately for a deadline in the past.
pub fn sleep_until(deadline_ns: u64) {
    let ts = to_timespec(deadline_ns);
    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc != libc::EINTR {
            debug_assert_eq!(rc, 0, "clock_nanosleep failed");
            return;
        }
    }
}

/// Advances `state` by one period and sleeps until the new wake time.
#[must_use]
pub fn wait_rest_of_period(state: PeriodState) -> PeriodState {
    let next = state.advance();
    sleep_until(next.next_wake_ns());
    next
}

/// Timing of one released cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    /// Zero-based cycle number.
    pub index: u64,
    /// Absolute wake time this cycle was scheduled for.
    pub deadline_ns: u64,
    /// When the body was actually entered.
    pub started_ns: u64,
}

impl Cycle {
    pub fn lateness_ns(&self) -> u64 {
        self.started_ns.saturating_sub(self.deadline_ns)
    }
}

/// What a finished loop observed.
#[derive(Debug, Clone)]
pub struct CycleStats {
    pub cycles: u64,
    /// Cycles whose body finished after the next cycle's deadline.
    pub overruns: u64,
    /// Release lateness (start minus deadline) in ns.
    pub lateness_ns: Samples<u64>,
}

impl CycleStats {
    fn new(history: usize) -> Self {
        Self {
            cycles: 0,
            overruns: 0,
            lateness_ns: Samples::with_capacity(history),
        }
    }
}

/// Runs a body on a fixed period.
#[derive(Debug, Clone)]
pub struct Scheduler {
    period: Duration,
    history: usize,
}

impl Scheduler {
    pub fn new(period: Duration) -> Result<Self, SetupError> {
        check_period(period)?;
        Ok(Self {
            period,
            history: DEFAULT_HISTORY,
        })
    }

    /// Number of recent lateness samples to keep for statistics.
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs until the body breaks.
    pub fn run<F>(&self, body: F) -> Result<CycleStats, SetupError>
    where
        F: FnMut(&Cycle) -> ControlFlow<()>,
    {
        self.run_until(&AtomicBool::new(false), body)
    }

    /// Runs until the body breaks or `shutdown` is set.
    ///
    /// `shutdown` is only checked between cycles.
    pub fn run_until<F>(&self, shutdown: &AtomicBool, mut body: F) -> Result<CycleStats, SetupError>
    where
        F: FnMut(&Cycle) -> ControlFlow<()>,
    {
        let mut state = PeriodState::arm(self.period)?;
        let mut stats = CycleStats::new(self.history);
        log::info!("cycle loop armed, period {:?}", self.period);

        while !shutdown.load(Ordering::Relaxed) {
            let cycle = Cycle {
                index: stats.cycles,
                deadline_ns: state.next_wake_ns(),
                started_ns: mono_time_ns(),
            };
            stats.cycles += 1;
            stats.lateness_ns.push(cycle.lateness_ns());

            if body(&cycle).is_break() {
                break;
            }

            state = state.advance();
            let finished_ns = mono_time_ns();
            if finished_ns > state.next_wake_ns() {
                stats.overruns += 1;
                log::trace!(
                    "cycle {} overran by {} ns",
                    cycle.index,
                    finished_ns - state.next_wake_ns()
                );
            }
            sleep_until(state.next_wake_ns());
        }

        log::info!(
            "cycle loop stopped after {} cycles, {} overruns",
            stats.cycles,
            stats.overruns
        );
        Ok(stats)
    }
}

/// Runs `body` every `period` until it breaks.
pub fn run<F>(period: Duration, body: F) -> Result<CycleStats, SetupError>
where
    F: FnMut(&Cycle) -> ControlFlow<()>,
{
    Scheduler::new(period)?.run(body)
}
