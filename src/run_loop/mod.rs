//! The cooperative event-dispatch scheduler.
//!
//! A [`RunLoop`] interleaves heterogeneous event sources — timers,
//! readable/writable descriptors, port message arrivals — under named
//! [`Mode`]s. One dispatch *pass* computes a wake deadline from the
//! nearest timer, blocks in a multiplexed wait for every descriptor
//! registered under the running mode (and the common pseudo-mode), then
//! fires due timers oldest-first before delivering at most one event per
//! ready source. Callbacks run to completion inside the pass and may
//! re-enter the loop; the current-mode stack is explicit so a nested
//! modal wait resumes the outer pass in its original mode.
//!
//! All of this is single-threaded and cooperative: a loop is driven
//! exclusively by its owning thread, and nothing here locks.

pub(crate) mod poll;
pub mod watcher;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::error::{Error, ErrorKind, Result};
use crate::mode::Mode;
use crate::port::Port;
use crate::time::Deadline;
use crate::timer::Timer;
use crate::util::arena::{SlotIndex, SlotTable};

use poll::{Interest, PollSet};
use watcher::{SourceIdent, WatchEvent, WatchKind, Watcher};

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// One counted watcher registration under a mode.
struct Registration {
    ident: SourceIdent,
    kind: WatchKind,
    watcher: Rc<dyn Watcher>,
    /// Re-adding the same (identity, kind) bumps this instead of
    /// duplicating the registration.
    count: usize,
    /// When set, the watcher is asked for a replacement date if this
    /// passes without an event.
    limit: Option<Instant>,
}

#[derive(Default)]
struct ModeState {
    timers: Vec<Timer>,
    watchers: SlotTable<Registration>,
    index: HashMap<(SourceIdent, WatchKind), SlotIndex>,
}

impl ModeState {
    fn sweep_timers(&mut self) {
        self.timers.retain(Timer::is_valid);
    }

    fn is_empty(&self) -> bool {
        self.timers.is_empty() && self.watchers.is_empty()
    }

    /// The caller must drop the returned registration only after
    /// releasing the modes borrow: dropping it may drop the last handle
    /// to a port, whose `Drop` re-enters the loop to detach itself.
    #[must_use]
    fn remove_registration(&mut self, key: (SourceIdent, WatchKind)) -> Option<Registration> {
        let index = self.index.remove(&key)?;
        self.watchers.remove(index)
    }
}

struct Inner {
    poll: RefCell<PollSet>,
    modes: RefCell<HashMap<Mode, ModeState>>,
    mode_stack: RefCell<Vec<Mode>>,
}

/// Configuration for a [`RunLoop`].
#[derive(Debug, Clone)]
pub struct RunLoopBuilder {
    event_capacity: usize,
}

impl RunLoopBuilder {
    /// Capacity of the readiness event buffer used per wait.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Builds the loop.
    ///
    /// # Errors
    ///
    /// Fails if the platform multiplexing primitive cannot be created.
    pub fn build(self) -> Result<RunLoop> {
        let poll = PollSet::new(self.event_capacity)
            .map_err(|err| Error::io(ErrorKind::Multiplex, err))?;
        Ok(RunLoop {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                modes: RefCell::new(HashMap::new()),
                mode_stack: RefCell::new(Vec::new()),
            }),
        })
    }
}

impl Default for RunLoopBuilder {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// The scheduler. Cheap to clone; clones share one loop.
///
/// A loop belongs to the thread that created it. Handles are neither
/// `Send` nor `Sync`; cross-thread delivery goes through an explicit
/// message send (see [`MessagePort`](crate::port::MessagePort)) that the
/// target loop picks up in its own pass.
#[derive(Clone)]
pub struct RunLoop {
    inner: Rc<Inner>,
}

/// Non-owning handle to a [`RunLoop`], held by ports and streams so that
/// dropping the loop does not keep it alive through its own sources.
#[derive(Clone)]
pub struct WeakRunLoop {
    inner: Weak<Inner>,
}

impl WeakRunLoop {
    /// Recovers the loop if it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<RunLoop> {
        self.inner.upgrade().map(|inner| RunLoop { inner })
    }
}

/// Pops the running mode even when a callback panics mid-pass.
struct ModeStackGuard<'a> {
    stack: &'a RefCell<Vec<Mode>>,
}

impl Drop for ModeStackGuard<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

/// One armed descriptor interest, with where to dispatch it.
struct ArmedFd {
    mode: Mode,
    index: SlotIndex,
}

#[derive(Default)]
struct FdPlan {
    interest: Interest,
    readers: Vec<ArmedFd>,
    writers: Vec<ArmedFd>,
}

impl RunLoop {
    /// Creates a loop with default settings.
    ///
    /// # Errors
    ///
    /// Fails if the platform multiplexing primitive cannot be created.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Returns a builder for configuring the loop.
    #[must_use]
    pub fn builder() -> RunLoopBuilder {
        RunLoopBuilder::default()
    }

    /// Returns a non-owning handle to this loop.
    #[must_use]
    pub fn downgrade(&self) -> WeakRunLoop {
        WeakRunLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// True if both handles refer to the same loop.
    #[must_use]
    pub fn same_loop(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The mode of the innermost pass currently running, if any.
    #[must_use]
    pub fn current_mode(&self) -> Option<Mode> {
        self.inner.mode_stack.borrow().last().cloned()
    }

    // === Registration ===

    /// Inserts `timer` into `mode`'s timer set.
    ///
    /// Already-invalid timers are ignored, as is re-adding a timer to a
    /// mode that already holds it.
    pub fn add_timer(&self, timer: &Timer, mode: &Mode) {
        if !timer.is_valid() {
            return;
        }
        let mut modes = self.inner.modes.borrow_mut();
        let state = modes.entry(mode.clone()).or_default();
        if !state.timers.iter().any(|t| t.same_timer(timer)) {
            tracing::trace!(mode = %mode, fire_date = ?timer.fire_date(), "timer added");
            state.timers.push(timer.clone());
        }
    }

    /// Registers `watcher` for `kind` events on `ident` under `mode`.
    ///
    /// Only one watcher object at a time may watch a given
    /// (identity, kind) pair in a mode; re-adding replaces the object and
    /// increments the registration count rather than duplicating it.
    pub fn add_watcher(
        &self,
        ident: SourceIdent,
        kind: WatchKind,
        watcher: Rc<dyn Watcher>,
        mode: &Mode,
    ) {
        self.add_watcher_with_limit(ident, kind, watcher, mode, None);
    }

    /// Like [`add_watcher`](Self::add_watcher), with a limit date: if it
    /// passes without an event, the watcher's
    /// [`timed_out`](Watcher::timed_out) decides whether the registration
    /// stays (with a new date) or goes.
    pub fn add_watcher_with_limit(
        &self,
        ident: SourceIdent,
        kind: WatchKind,
        watcher: Rc<dyn Watcher>,
        mode: &Mode,
        limit: Option<Instant>,
    ) {
        let replaced = {
            let mut modes = self.inner.modes.borrow_mut();
            let state = modes.entry(mode.clone()).or_default();
            let existing = state
                .index
                .get(&(ident, kind))
                .copied()
                .and_then(|index| state.watchers.get_mut(index));
            if let Some(registration) = existing {
                let old = std::mem::replace(&mut registration.watcher, watcher);
                registration.count += 1;
                registration.limit = limit;
                Some(old)
            } else {
                tracing::trace!(mode = %mode, ?ident, ?kind, "watcher added");
                let index = state.watchers.insert(Registration {
                    ident,
                    kind,
                    watcher,
                    count: 1,
                    limit,
                });
                state.index.insert((ident, kind), index);
                None
            }
        };
        drop(replaced);
    }

    /// Removes one registration count for (`ident`, `kind`) under `mode`,
    /// or the whole registration when `all` is set, irrespective of how
    /// many times it was added. Removing something never registered is a
    /// no-op.
    ///
    /// Takes effect immediately: a source removed from inside another
    /// callback in the same pass will not fire.
    pub fn remove_watcher(&self, ident: SourceIdent, kind: WatchKind, mode: &Mode, all: bool) {
        let removed = {
            let mut modes = self.inner.modes.borrow_mut();
            let Some(state) = modes.get_mut(mode) else {
                return;
            };
            let Some(&index) = state.index.get(&(ident, kind)) else {
                return;
            };
            match state.watchers.get_mut(index) {
                Some(registration) if !all && registration.count > 1 => {
                    registration.count -= 1;
                    None
                }
                _ => {
                    tracing::trace!(mode = %mode, ?ident, ?kind, "watcher removed");
                    state.remove_registration((ident, kind))
                }
            }
        };
        drop(removed);
    }

    /// Adds a port as an event source under `mode`. Invalid ports are
    /// ignored.
    pub fn add_port<P: Port + 'static>(&self, port: &Rc<P>, mode: &Mode) {
        if !port.is_valid() {
            return;
        }
        let watcher: Rc<dyn Watcher> = port.clone();
        self.add_watcher(
            SourceIdent::Port(port.id()),
            WatchKind::PortMessage,
            watcher,
            mode,
        );
        port.attached(self, mode);
    }

    /// Removes a port from `mode`. The port itself stays valid.
    pub fn remove_port<P: Port + 'static>(&self, port: &Rc<P>, mode: &Mode) {
        self.remove_watcher(
            SourceIdent::Port(port.id()),
            WatchKind::PortMessage,
            mode,
            true,
        );
        port.detached(self, mode);
    }

    // === Running ===

    /// The nearest future timer fire date in `mode` (and the common
    /// pseudo-mode), [`Deadline::DistantFuture`] when watchers are
    /// registered but no timers, or `None` when the mode is empty — the
    /// caller must not block on an empty mode.
    #[must_use]
    pub fn limit_date(&self, mode: &Mode) -> Option<Deadline> {
        let consult = consulted_modes(mode);
        let mut modes = self.inner.modes.borrow_mut();
        let mut nearest: Option<Deadline> = None;
        let mut empty = true;
        for m in &consult {
            if let Some(state) = modes.get_mut(m) {
                state.sweep_timers();
                if !state.is_empty() {
                    empty = false;
                }
                for timer in &state.timers {
                    let at = Deadline::At(timer.fire_date());
                    nearest = Some(nearest.map_or(at, |d| d.earlier(at)));
                }
            }
        }
        if empty {
            None
        } else {
            Some(nearest.unwrap_or(Deadline::DistantFuture))
        }
    }

    /// Performs exactly one wait-and-dispatch pass in `mode`.
    ///
    /// Blocks until the earlier of `limit`, the nearest timer fire date,
    /// or a registered source becoming ready; then fires every due timer
    /// oldest-first and delivers at most one event per ready source.
    /// Returns immediately when the mode has nothing registered.
    ///
    /// # Errors
    ///
    /// Only an unrecoverable failure of the multiplexed wait itself is
    /// returned; per-source I/O errors are confined to their source.
    pub fn accept_input(&self, mode: &Mode, limit: Deadline) -> Result<()> {
        self.inner.mode_stack.borrow_mut().push(mode.clone());
        let guard = ModeStackGuard {
            stack: &self.inner.mode_stack,
        };
        let result = self.pass(mode, limit);
        drop(guard);
        result
    }

    /// Runs one pass in `mode`, blocking until `before` at the latest.
    /// Returns `false`, without waiting, if the mode has nothing
    /// registered.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable multiplexing failures from the pass.
    pub fn run_mode(&self, mode: &Mode, before: Deadline) -> Result<bool> {
        if self.limit_date(mode).is_none() {
            return Ok(false);
        }
        self.accept_input(mode, before)?;
        Ok(true)
    }

    /// Runs the default mode until it has no sources left.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable multiplexing failures.
    pub fn run(&self) -> Result<()> {
        let mode = Mode::default_mode();
        while self.run_mode(&mode, Deadline::DistantFuture)? {}
        Ok(())
    }

    /// Runs the default mode until `date` passes or no sources remain.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable multiplexing failures.
    pub fn run_until(&self, date: Instant) -> Result<()> {
        let mode = Mode::default_mode();
        while Instant::now() < date {
            if !self.run_mode(&mode, Deadline::At(date))? {
                break;
            }
        }
        Ok(())
    }

    // === Pass internals ===

    fn pass(&self, mode: &Mode, limit: Deadline) -> Result<()> {
        let consult = consulted_modes(mode);
        let now = Instant::now();

        // Deadline: the caller's limit, the nearest timer, and any
        // watcher limit dates that need a timed-out callback.
        let mut deadline = limit;
        let mut have_timers = false;
        {
            let mut modes = self.inner.modes.borrow_mut();
            for m in &consult {
                if let Some(state) = modes.get_mut(m) {
                    state.sweep_timers();
                    for timer in &state.timers {
                        have_timers = true;
                        deadline = deadline.earlier(Deadline::At(timer.fire_date()));
                    }
                    for (_, registration) in state.watchers.iter() {
                        if let Some(at) = registration.limit {
                            deadline = deadline.earlier(Deadline::At(at));
                        }
                    }
                }
            }
        }

        // Snapshot registrations, then query descriptor sets with no
        // borrow held: a port's descriptor table may be consulted while
        // another callback is mutating registrations.
        let snapshot: Vec<(Mode, SlotIndex, Rc<dyn Watcher>, SourceIdent, WatchKind)> = {
            let modes = self.inner.modes.borrow();
            consult
                .iter()
                .filter_map(|m| modes.get(m).map(|state| (m, state)))
                .flat_map(|(m, state)| {
                    state.watchers.iter().map(|(index, registration)| {
                        (
                            m.clone(),
                            index,
                            registration.watcher.clone(),
                            registration.ident,
                            registration.kind,
                        )
                    })
                })
                .collect()
        };

        if snapshot.is_empty() && !have_timers {
            return Ok(());
        }

        let mut plan: HashMap<RawFd, FdPlan> = HashMap::new();
        for (m, index, watcher, ident, kind) in &snapshot {
            let pairs = watcher.descriptors().unwrap_or_else(|| match ident {
                SourceIdent::Descriptor(fd) => vec![(*fd, *kind)],
                SourceIdent::Port(_) => Vec::new(),
            });
            for (fd, pair_kind) in pairs {
                let entry = plan.entry(fd).or_default();
                let armed = ArmedFd {
                    mode: m.clone(),
                    index: *index,
                };
                match pair_kind {
                    WatchKind::Writable => {
                        entry.interest.writable = true;
                        entry.writers.push(armed);
                    }
                    // Out-of-band data is reported through the readable
                    // condition on this platform.
                    WatchKind::Readable | WatchKind::OutOfBand | WatchKind::PortMessage => {
                        entry.interest.readable = true;
                        entry.readers.push(armed);
                    }
                }
            }
        }

        tracing::trace!(
            mode = %mode,
            descriptors = plan.len(),
            timers = have_timers,
            ?deadline,
            "pass waiting"
        );

        let ready = {
            let desired: HashMap<RawFd, Interest> = plan
                .iter()
                .map(|(&fd, entry)| (fd, entry.interest))
                .collect();
            let mut poll = self.inner.poll.borrow_mut();
            poll.begin_pass(&desired)
                .map_err(|err| Error::io(ErrorKind::Multiplex, err))?;
            poll.wait_until(deadline)
                .map_err(|err| Error::io(ErrorKind::Multiplex, err))?
        };

        let now = now.max(Instant::now());
        self.fire_due_timers(&consult, now);

        // I/O dispatch. A source ready for both conditions gets one
        // callback carrying both flags, not two callbacks.
        let mut fired: Vec<(Mode, SlotIndex)> = Vec::new();
        for event in &ready {
            let Some(entry) = plan.get(&event.fd) else {
                continue;
            };
            let mut targets: Vec<(Mode, SlotIndex, bool, bool)> = Vec::new();
            if event.readable {
                for armed in &entry.readers {
                    targets.push((armed.mode.clone(), armed.index, true, false));
                }
            }
            if event.writable {
                for armed in &entry.writers {
                    match targets
                        .iter_mut()
                        .find(|(m, index, _, _)| *index == armed.index && *m == armed.mode)
                    {
                        Some(target) => target.3 = true,
                        None => targets.push((armed.mode.clone(), armed.index, false, true)),
                    }
                }
            }
            for (m, index, readable, writable) in targets {
                fired.push((m.clone(), index));
                self.dispatch_ready(&m, index, mode, event.fd, readable, writable);
            }
        }

        self.run_timed_out(&consult, mode, now, &fired);
        Ok(())
    }

    fn fire_due_timers(&self, consult: &[Mode], now: Instant) {
        let mut due: Vec<Timer> = {
            let modes = self.inner.modes.borrow();
            consult
                .iter()
                .filter_map(|m| modes.get(m))
                .flat_map(|state| state.timers.iter())
                .filter(|t| t.is_valid() && t.fire_date() <= now)
                .cloned()
                .collect()
        };
        due.sort_by_key(Timer::fire_date);
        due.dedup_by(|a, b| a.same_timer(b));
        for timer in due {
            // Re-checks validity and due-ness: a timer invalidated by an
            // earlier action in this pass stays quiet.
            timer.fire_if_due(now);
        }
        let mut modes = self.inner.modes.borrow_mut();
        for m in consult {
            if let Some(state) = modes.get_mut(m) {
                state.sweep_timers();
            }
        }
    }

    fn dispatch_ready(
        &self,
        mode_key: &Mode,
        index: SlotIndex,
        current: &Mode,
        fd: RawFd,
        readable: bool,
        writable: bool,
    ) {
        // Re-resolve through the slot table: a registration removed by an
        // earlier callback in this pass no longer resolves and must not
        // fire.
        let entry = {
            let modes = self.inner.modes.borrow();
            modes
                .get(mode_key)
                .and_then(|state| state.watchers.get(index))
                .map(|registration| (registration.watcher.clone(), registration.kind))
        };
        if let Some((watcher, kind)) = entry {
            let event = WatchEvent {
                kind,
                fd,
                readable,
                writable,
            };
            watcher.ready(self, current, event);
        }
    }

    fn run_timed_out(&self, consult: &[Mode], current: &Mode, now: Instant, fired: &[(Mode, SlotIndex)]) {
        let expired: Vec<(Mode, SlotIndex, Rc<dyn Watcher>, SourceIdent, WatchKind)> = {
            let modes = self.inner.modes.borrow();
            consult
                .iter()
                .filter_map(|m| modes.get(m).map(|state| (m, state)))
                .flat_map(|(m, state)| {
                    state.watchers.iter().filter_map(move |(index, registration)| {
                        let limit = registration.limit?;
                        if limit > now {
                            return None;
                        }
                        Some((
                            m.clone(),
                            index,
                            registration.watcher.clone(),
                            registration.ident,
                            registration.kind,
                        ))
                    })
                })
                .collect()
        };
        for (m, index, watcher, ident, kind) in expired {
            if fired.iter().any(|(fm, fi)| *fi == index && fm == &m) {
                continue;
            }
            let verdict = watcher.timed_out(self, current, kind);
            let removed = {
                let mut modes = self.inner.modes.borrow_mut();
                let Some(state) = modes.get_mut(&m) else {
                    continue;
                };
                match verdict {
                    Some(new_limit) => {
                        if let Some(registration) = state.watchers.get_mut(index) {
                            registration.limit = Some(new_limit);
                        }
                        None
                    }
                    // Only remove what we observed expiring; the callback
                    // may already have re-registered the pair.
                    None if state.watchers.get(index).is_some() => {
                        state.remove_registration((ident, kind))
                    }
                    None => None,
                }
            };
            drop(removed);
        }
    }
}

/// A pass in `mode` also consults sources registered under the common
/// pseudo-mode.
fn consulted_modes(mode: &Mode) -> Vec<Mode> {
    if mode.is_common() {
        vec![mode.clone()]
    } else {
        vec![mode.clone(), Mode::common()]
    }
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modes = self.inner.modes.borrow();
        let mut map = f.debug_map();
        for (mode, state) in modes.iter() {
            map.entry(
                &mode.name(),
                &format_args!(
                    "{} timers, {} watchers",
                    state.timers.len(),
                    state.watchers.len()
                ),
            );
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    struct NoopWatcher;

    impl Watcher for NoopWatcher {
        fn ready(&self, _run_loop: &RunLoop, _mode: &Mode, _event: WatchEvent) {}
    }

    #[test]
    fn test_limit_date_reflects_registrations() {
        let rl = RunLoop::new().unwrap();
        let mode = Mode::default_mode();
        assert!(rl.limit_date(&mode).is_none());

        rl.add_watcher(
            SourceIdent::Descriptor(0),
            WatchKind::Readable,
            Rc::new(NoopWatcher),
            &mode,
        );
        assert_eq!(rl.limit_date(&mode), Some(Deadline::DistantFuture));

        let timer = Timer::new(Duration::from_secs(5), false, |_| {});
        rl.add_timer(&timer, &mode);
        assert_eq!(rl.limit_date(&mode), Some(Deadline::At(timer.fire_date())));

        timer.invalidate();
        assert_eq!(rl.limit_date(&mode), Some(Deadline::DistantFuture));
    }

    #[test]
    fn test_common_mode_sources_count_in_every_mode() {
        let rl = RunLoop::new().unwrap();
        let timer = Timer::new(Duration::from_secs(5), false, |_| {});
        rl.add_timer(&timer, &Mode::common());
        assert!(rl.limit_date(&Mode::default_mode()).is_some());
        assert!(rl.limit_date(&Mode::new("modal")).is_some());
    }

    #[test]
    fn test_watcher_counts_survive_single_removal() {
        let rl = RunLoop::new().unwrap();
        let mode = Mode::default_mode();
        let ident = SourceIdent::Descriptor(7);
        let watcher: Rc<dyn Watcher> = Rc::new(NoopWatcher);
        rl.add_watcher(ident, WatchKind::Readable, watcher.clone(), &mode);
        rl.add_watcher(ident, WatchKind::Readable, watcher.clone(), &mode);

        rl.remove_watcher(ident, WatchKind::Readable, &mode, false);
        assert!(rl.limit_date(&mode).is_some());

        rl.remove_watcher(ident, WatchKind::Readable, &mode, false);
        assert!(rl.limit_date(&mode).is_none());

        // Removing what is no longer there is a no-op.
        rl.remove_watcher(ident, WatchKind::Readable, &mode, true);
    }

    #[test]
    fn test_remove_all_clears_count_depth() {
        let rl = RunLoop::new().unwrap();
        let mode = Mode::default_mode();
        let ident = SourceIdent::Descriptor(7);
        let watcher: Rc<dyn Watcher> = Rc::new(NoopWatcher);
        for _ in 0..5 {
            rl.add_watcher(ident, WatchKind::Readable, watcher.clone(), &mode);
        }
        rl.remove_watcher(ident, WatchKind::Readable, &mode, true);
        assert!(rl.limit_date(&mode).is_none());
    }

    #[test]
    fn test_run_mode_returns_false_on_empty_mode() {
        let rl = RunLoop::new().unwrap();
        assert!(!rl.run_mode(&Mode::default_mode(), Deadline::DistantFuture).unwrap());
    }

    #[test]
    fn test_one_shot_timer_fires_once_then_mode_drains() {
        let rl = RunLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let timer = Timer::new(Duration::from_millis(10), false, move |_| {
            seen.set(seen.get() + 1);
        });
        rl.add_timer(&timer, &Mode::default_mode());

        let start = Instant::now();
        rl.run_until(start + Duration::from_secs(1)).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(count.get(), 1);
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500), "returned at {elapsed:?}");
    }

    #[test]
    fn test_mode_stack_restored_after_nested_run() {
        let rl = RunLoop::new().unwrap();
        let observed = Rc::new(RefCell::new(Vec::new()));

        let inner_rl = rl.clone();
        let seen = observed.clone();
        let timer = Timer::new(Duration::ZERO, false, move |_| {
            seen.borrow_mut().push(inner_rl.current_mode().unwrap());
            // Nested modal wait in another mode.
            let modal = Mode::new("modal");
            let inner_seen = seen.clone();
            let closure_seen = inner_seen.clone();
            let probe = inner_rl.clone();
            let nested = Timer::new(Duration::ZERO, false, move |_| {
                closure_seen.borrow_mut().push(probe.current_mode().unwrap());
            });
            inner_rl.add_timer(&nested, &modal);
            inner_rl
                .run_mode(&modal, Deadline::after(Duration::from_secs(1)))
                .unwrap();
            inner_seen.borrow_mut().push(inner_rl.current_mode().unwrap());
        });
        rl.add_timer(&timer, &Mode::default_mode());
        rl.run_until(Instant::now() + Duration::from_secs(1)).unwrap();

        let modes = observed.borrow();
        assert_eq!(
            modes.as_slice(),
            &[Mode::default_mode(), Mode::new("modal"), Mode::default_mode()]
        );
        assert!(rl.current_mode().is_none());
    }

    #[test]
    fn test_repeating_timer_fires_at_most_once_per_pass() {
        let rl = RunLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let timer = Timer::new(Duration::from_millis(5), true, move |_| {
            seen.set(seen.get() + 1);
        });
        rl.add_timer(&timer, &Mode::default_mode());

        rl.accept_input(&Mode::default_mode(), Deadline::after(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(count.get(), 1);

        timer.invalidate();
        assert!(rl.limit_date(&Mode::default_mode()).is_none());
    }
}
