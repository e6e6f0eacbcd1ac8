//! Timer integration tests with real waits.
//!
//! Covered behavior:
//! - Repeating timers settle on their interval, one fire per pass
//! - Invalidation from inside a callback silences the timer immediately
//! - A drained default mode ends `run_until` early

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::*;
use runloop::{Deadline, Mode, RunLoop, Timer};

#[test]
fn test_single_shot_fires_once_and_run_until_returns_early() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let count = Rc::new(Cell::new(0));
    let seen = count.clone();
    let timer = Timer::new(Duration::from_millis(100), false, move |_| {
        seen.set(seen.get() + 1);
    });
    rl.add_timer(&timer, &Mode::default_mode());

    let start = Instant::now();
    rl.run_until(start + Duration::from_secs(1)).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(count.get(), 1);
    assert!(!timer.is_valid(), "one-shot timers invalidate by firing");
    assert!(elapsed >= Duration::from_millis(100), "fired at {elapsed:?}");
    assert!(
        elapsed < Duration::from_millis(700),
        "loop lingered for {elapsed:?} after the mode drained"
    );
}

#[test]
fn test_repeating_intervals_converge() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let interval = Duration::from_millis(25);
    let fires: Rc<RefCell<Vec<Instant>>> = Rc::new(RefCell::new(Vec::new()));

    let seen = fires.clone();
    let timer = Timer::new(interval, true, move |_| {
        seen.borrow_mut().push(Instant::now());
    });
    rl.add_timer(&timer, &Mode::default_mode());

    assert!(drive_until(&rl, &Mode::default_mode(), DRIVE_TIMEOUT, || {
        fires.borrow().len() >= 6
    }));
    timer.invalidate();

    let fires = fires.borrow();
    for pair in fires.windows(2) {
        let gap = pair[1] - pair[0];
        // One fire per pass with reschedule-before-action: gaps hover at
        // the interval, never collapse into a catch-up burst.
        assert!(
            gap >= interval.mul_f64(0.6),
            "fires {gap:?} apart, expected about {interval:?}"
        );
        assert!(
            gap <= interval.mul_f64(8.0),
            "fires {gap:?} apart, expected about {interval:?}"
        );
    }
}

#[test]
fn test_invalidate_from_own_action_is_final() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let count = Rc::new(Cell::new(0));
    let seen = count.clone();
    let timer = Timer::new(Duration::from_millis(5), true, move |t: &Timer| {
        seen.set(seen.get() + 1);
        t.invalidate();
    });
    rl.add_timer(&timer, &Mode::default_mode());

    rl.run_until(Instant::now() + Duration::from_millis(200)).unwrap();

    assert_eq!(count.get(), 1);
    assert!(rl.limit_date(&Mode::default_mode()).is_none());
}

#[test]
fn test_invalidating_a_peer_in_the_same_pass_silences_it() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let victim_fired = Rc::new(Cell::new(false));

    let seen = victim_fired.clone();
    let victim = Timer::with_fire_date(
        Instant::now() + Duration::from_millis(2),
        Duration::from_millis(2),
        false,
        move |_| seen.set(true),
    );
    let doomed = victim.clone();
    let assassin = Timer::with_fire_date(
        Instant::now() + Duration::from_millis(1),
        Duration::from_millis(1),
        false,
        move |_| doomed.invalidate(),
    );
    rl.add_timer(&victim, &Mode::default_mode());
    rl.add_timer(&assassin, &Mode::default_mode());

    // Let both fall due, then dispatch a single pass: the earlier timer
    // fires first and kills the later one before its turn.
    std::thread::sleep(Duration::from_millis(10));
    rl.accept_input(&Mode::default_mode(), Deadline::after(Duration::from_millis(50)))
        .unwrap();

    assert!(!victim_fired.get());
    assert!(!victim.is_valid());
}

#[test]
fn test_timer_in_two_modes_fires_in_either() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let count = Rc::new(Cell::new(0));
    let seen = count.clone();
    let timer = Timer::new(Duration::from_millis(5), true, move |_| {
        seen.set(seen.get() + 1);
    });
    rl.add_timer(&timer, &Mode::default_mode());
    rl.add_timer(&timer, &Mode::new("modal"));

    std::thread::sleep(Duration::from_millis(10));
    rl.accept_input(&Mode::new("modal"), Deadline::after(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(count.get(), 1);

    std::thread::sleep(Duration::from_millis(10));
    rl.accept_input(&Mode::default_mode(), Deadline::after(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(count.get(), 2);

    timer.invalidate();
}
