//! Watcher registration types for run-loop event sources.
//!
//! Anything the loop can wait on — a descriptor becoming readable or
//! writable, out-of-band data, a message arriving on a port — is
//! registered as a [`Watcher`] for a ([`SourceIdent`], [`WatchKind`])
//! pair under some mode. Only one watcher object at a time may watch a
//! given pair in a mode, but the same watcher may be added repeatedly;
//! the loop keeps a count and removal is by count or all-at-once.

use std::os::fd::RawFd;
use std::time::Instant;

use crate::mode::Mode;
use crate::port::PortId;
use crate::run_loop::RunLoop;

/// The condition a watcher waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Descriptor becoming readable.
    Readable,
    /// Descriptor becoming writable.
    Writable,
    /// Descriptor with out-of-band data.
    ///
    /// Multiplexed through the readable condition where the platform
    /// reports exceptional data that way.
    OutOfBand,
    /// Message arriving on a port.
    PortMessage,
}

/// Identity of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceIdent {
    /// A raw file descriptor.
    Descriptor(RawFd),
    /// A port; the loop obtains its descriptor set from the watcher.
    Port(PortId),
}

/// A readiness notification delivered to a watcher.
#[derive(Debug, Clone, Copy)]
pub struct WatchEvent {
    /// The kind the watcher was registered for.
    pub kind: WatchKind,
    /// The descriptor that became ready. For a port watcher this is one
    /// member of the port's descriptor set.
    pub fd: RawFd,
    /// Readable condition observed.
    pub readable: bool,
    /// Writable condition observed.
    pub writable: bool,
}

/// Callback interface for registered event sources.
///
/// Callbacks run to completion inside the dispatch pass; a watcher may
/// re-enter the loop (`run_mode`) or mutate registrations, including its
/// own, from inside `ready`.
pub trait Watcher {
    /// The watched condition occurred.
    fn ready(&self, run_loop: &RunLoop, mode: &Mode, event: WatchEvent);

    /// The watcher's limit date passed without an event.
    ///
    /// Returning a new date keeps the registration with that limit;
    /// returning `None` removes it.
    fn timed_out(&self, run_loop: &RunLoop, mode: &Mode, kind: WatchKind) -> Option<Instant> {
        let _ = (run_loop, mode, kind);
        None
    }

    /// The descriptors to multiplex this pass, with the condition to wait
    /// for on each.
    ///
    /// Plain descriptor watchers keep the default `None` and are armed
    /// from their registration identity. Sources whose descriptor set or
    /// interest changes over time — a port with a live connection table,
    /// a stream whose interest depends on its status — override it; the
    /// loop queries it once per pass, and `Some(vec![])` arms nothing
    /// for that pass.
    fn descriptors(&self) -> Option<Vec<(RawFd, WatchKind)>> {
        None
    }
}
