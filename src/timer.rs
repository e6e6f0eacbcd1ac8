//! Timers scheduled on a run loop.
//!
//! A [`Timer`] is created detached and becomes live once added to a run
//! loop under some mode. Invalidation is a flag, not a deallocation: the
//! loop holds its own handle and discards it on the next sweep, so
//! invalidating from inside any callback — including the timer's own —
//! reliably prevents every later firing.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::mode::Mode;
use crate::run_loop::RunLoop;

/// Action invoked when a timer fires.
pub type TimerAction = Box<dyn FnMut(&Timer)>;

struct TimerState {
    fire_date: Instant,
    interval: Duration,
    repeats: bool,
    valid: bool,
}

struct TimerInner {
    state: RefCell<TimerState>,
    action: RefCell<TimerAction>,
}

/// A fire-date/interval value with an action and optional repeat flag.
///
/// Cloning yields another handle to the same timer.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    /// Creates a detached timer firing `delay` from now.
    ///
    /// For a repeating timer, `delay` is also the repeat interval.
    #[must_use]
    pub fn new(delay: Duration, repeats: bool, action: impl FnMut(&Timer) + 'static) -> Self {
        Self::with_fire_date(Instant::now() + delay, delay, repeats, action)
    }

    /// Creates a detached timer with an explicit first fire date and
    /// repeat interval.
    #[must_use]
    pub fn with_fire_date(
        fire_date: Instant,
        interval: Duration,
        repeats: bool,
        action: impl FnMut(&Timer) + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                state: RefCell::new(TimerState {
                    fire_date,
                    interval,
                    repeats,
                    valid: true,
                }),
                action: RefCell::new(Box::new(action)),
            }),
        }
    }

    /// Creates a timer and adds it to `run_loop`'s default mode.
    pub fn scheduled(
        run_loop: &RunLoop,
        delay: Duration,
        repeats: bool,
        action: impl FnMut(&Timer) + 'static,
    ) -> Self {
        let timer = Self::new(delay, repeats, action);
        run_loop.add_timer(&timer, &Mode::default_mode());
        timer
    }

    /// True until [`invalidate`](Self::invalidate) is called (or a
    /// non-repeating timer fires).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.state.borrow().valid
    }

    /// Stops the timer. Idempotent; effective immediately, even from
    /// inside the timer's own action.
    pub fn invalidate(&self) {
        self.inner.state.borrow_mut().valid = false;
    }

    /// The next fire date.
    #[must_use]
    pub fn fire_date(&self) -> Instant {
        self.inner.state.borrow().fire_date
    }

    /// Moves the next fire date.
    pub fn set_fire_date(&self, fire_date: Instant) {
        self.inner.state.borrow_mut().fire_date = fire_date;
    }

    /// The repeat interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.state.borrow().interval
    }

    /// True if the timer reschedules itself after firing.
    #[must_use]
    pub fn repeats(&self) -> bool {
        self.inner.state.borrow().repeats
    }

    /// Fires the timer now, regardless of its fire date.
    ///
    /// A non-repeating timer is invalidated by firing; a repeating timer's
    /// schedule is unchanged.
    pub fn fire(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.valid {
                return;
            }
            if !state.repeats {
                state.valid = false;
            }
        }
        self.invoke();
    }

    /// Fires the timer from a dispatch pass if it is live and due.
    ///
    /// A repeating timer is rescheduled to `fire_date + interval` — or
    /// `now + interval` when that is already past, so a handler that
    /// overruns its own interval produces at most one fire per pass
    /// rather than a catch-up burst. Rescheduling happens before the
    /// action runs, so a handler that re-enters the loop sees a
    /// consistent future schedule. Returns whether the timer fired.
    pub(crate) fn fire_if_due(&self, now: Instant) -> bool {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.valid || state.fire_date > now {
                return false;
            }
            if state.repeats {
                let mut next = state.fire_date + state.interval;
                if next <= now {
                    next = now + state.interval;
                }
                state.fire_date = next;
            } else {
                state.valid = false;
            }
        }
        self.invoke();
        true
    }

    fn invoke(&self) {
        // A nested pass can find this timer due again while its action is
        // still on the stack; the failed borrow skips that re-entry.
        if let Ok(mut action) = self.inner.action.try_borrow_mut() {
            action(self);
        }
    }

    /// Identity comparison for loop bookkeeping.
    pub(crate) fn same_timer(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.same_timer(other)
    }
}

impl Eq for Timer {}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Timer")
            .field("fire_date", &state.fire_date)
            .field("interval", &state.interval)
            .field("repeats", &state.repeats)
            .field("valid", &state.valid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_one_shot_invalidated_by_firing() {
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let timer = Timer::new(Duration::ZERO, false, move |_| seen.set(seen.get() + 1));
        let now = Instant::now();
        assert!(timer.fire_if_due(now));
        assert!(!timer.is_valid());
        assert!(!timer.fire_if_due(now));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_not_due_does_not_fire() {
        let timer = Timer::new(Duration::from_secs(60), false, |_| panic!("fired early"));
        assert!(!timer.fire_if_due(Instant::now()));
        assert!(timer.is_valid());
    }

    #[test]
    fn test_overrun_repeat_reschedules_relative_to_now() {
        let timer = Timer::new(Duration::from_millis(1), true, |_| {});
        let late = Instant::now() + Duration::from_secs(10);
        assert!(timer.fire_if_due(late));
        // fire_date + interval is long past `late`, so the schedule is
        // re-anchored to `late` instead of queueing a catch-up burst.
        assert_eq!(timer.fire_date(), late + Duration::from_millis(1));
    }

    #[test]
    fn test_invalidate_from_own_action() {
        let timer = Timer::new(Duration::ZERO, true, |t: &Timer| t.invalidate());
        let now = Instant::now();
        assert!(timer.fire_if_due(now));
        assert!(!timer.is_valid());
        assert!(!timer.fire_if_due(now + Duration::from_secs(1)));
    }
}
