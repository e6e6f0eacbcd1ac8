//! Thin wrapper over the platform multiplexing primitive.
//!
//! Built on [`polling`], which delivers events in oneshot mode: a
//! descriptor's interest is consumed by delivery and must be re-armed
//! before the next wait. The run loop re-arms its whole descriptor set at
//! the top of every pass via [`PollSet::begin_pass`], which also disarms
//! descriptors the current mode no longer watches.
//!
//! Interrupted waits are retried here with a recomputed timeout and never
//! surface to callers.

use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Instant;

use polling::{Event, Events, Poller};

use crate::time::Deadline;

/// Readiness observed for one descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Interest to arm for one descriptor in the coming pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct PollSet {
    poller: Poller,
    events: Events,
    /// Descriptors known to the poller (added, not yet deleted).
    registered: HashSet<RawFd>,
    /// Descriptors armed for the pass in flight.
    armed: HashSet<RawFd>,
}

impl PollSet {
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(event_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            poller: Poller::new()?,
            events: Events::with_capacity(capacity),
            registered: HashSet::new(),
            armed: HashSet::new(),
        })
    }

    /// Arms exactly the given descriptor set for the coming wait.
    pub(crate) fn begin_pass(&mut self, desired: &HashMap<RawFd, Interest>) -> io::Result<()> {
        let stale: Vec<RawFd> = self
            .armed
            .iter()
            .copied()
            .filter(|fd| !desired.contains_key(fd))
            .collect();
        for fd in stale {
            // The descriptor may already be closed; nothing to unwind then.
            let _ = self.modify(fd, Event::none(fd as usize));
            self.armed.remove(&fd);
        }
        for (&fd, interest) in desired {
            self.arm(fd, *interest)?;
            self.armed.insert(fd);
        }
        Ok(())
    }

    /// Blocks until the deadline passes or an armed descriptor is ready.
    pub(crate) fn wait_until(&mut self, deadline: Deadline) -> io::Result<Vec<Ready>> {
        loop {
            let timeout = deadline.timeout_from(Instant::now());
            self.events.clear();
            match self.poller.wait(&mut self.events, timeout) {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        let mut ready = Vec::with_capacity(self.events.len());
        for event in self.events.iter() {
            let fd = event.key as RawFd;
            // Delivery consumed the oneshot arm.
            self.armed.remove(&fd);
            ready.push(Ready {
                fd,
                readable: event.readable,
                writable: event.writable,
            });
        }
        Ok(ready)
    }

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let key = fd as usize;
        let event = match (interest.readable, interest.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        };
        if self.registered.contains(&fd) {
            match self.modify(fd, event) {
                Ok(()) => return Ok(()),
                // The slot can be gone despite our bookkeeping when the OS
                // reused a closed descriptor's number; fall through to add.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        self.add(fd, event)?;
        self.registered.insert(fd);
        Ok(())
    }

    #[allow(unsafe_code)]
    fn add(&self, fd: RawFd, event: Event) -> io::Result<()> {
        // SAFETY: the descriptor set is rebuilt from live sources at the
        // top of every pass, so the fd is open when armed; closing it
        // detaches it from the kernel set on its own.
        unsafe { self.poller.add(fd, event) }
    }

    #[allow(unsafe_code)]
    fn modify(&self, fd: RawFd, event: Event) -> io::Result<()> {
        // SAFETY: as for `add`; the fd is open when re-armed.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.modify(borrowed, event)
    }
}

impl std::fmt::Debug for PollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSet")
            .field("registered", &self.registered.len())
            .field("armed", &self.armed.len())
            .finish()
    }
}
