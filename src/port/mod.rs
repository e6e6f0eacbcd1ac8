//! Message-oriented communication endpoints.
//!
//! A [`Port`] is a bidirectional endpoint delivering whole framed
//! messages: partial reads are buffered internally and the delegate only
//! ever sees a fully reassembled payload. Two concrete ports exist —
//! [`SocketPort`] over TCP or Unix-domain sockets and [`MessagePort`] for
//! same-host delivery without network sockets.
//!
//! Ports are not owned by the run loops they are added to. Invalidating a
//! port detaches it from every loop it was registered with and fires a
//! process-wide broadcast (see [`observe_invalidation`]); dropping the
//! last run-loop registration leaves the port valid.

pub mod frame;
pub mod message;
pub mod socket;

pub use frame::FrameCodec;
pub use message::{MessagePort, MessagePortSender};
pub use socket::{HandleId, SocketPort};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Error;
use crate::mode::Mode;
use crate::run_loop::watcher::{SourceIdent, WatchKind, Watcher};
use crate::run_loop::{RunLoop, WeakRunLoop};

/// Identity of a port, stable for its lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl PortId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A fully reassembled message delivered by a port.
#[derive(Debug, Clone)]
pub struct PortMessage {
    payload: Bytes,
    sender: Option<HandleId>,
}

impl PortMessage {
    pub(crate) fn new(payload: Bytes, sender: Option<HandleId>) -> Self {
        Self { payload, sender }
    }

    /// The message payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the message, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// For a message arriving over a [`SocketPort`], the connection handle
    /// it arrived on — pass it to [`SocketPort::send_to`] to reply.
    #[must_use]
    pub fn sender(&self) -> Option<HandleId> {
        self.sender
    }
}

/// Callbacks a port's owner registers for delivery and failure.
pub trait PortDelegate {
    /// A complete message arrived.
    fn handle_message(&self, message: PortMessage);

    /// An I/O failure was isolated to this port (or one of its
    /// connections). The port, or the failed connection, has already been
    /// shut down.
    fn handle_error(&self, error: &Error) {
        let _ = error;
    }
}

/// Abstract message-oriented endpoint schedulable on a run loop.
///
/// The [`Watcher`] supertrait is how the loop drives a port: the port
/// reports its live descriptor set each pass and services readiness in
/// `ready`, forwarding reassembled messages to its delegate.
pub trait Port: Watcher {
    /// This port's identity.
    fn id(&self) -> PortId;

    /// False once [`invalidate`](Port::invalidate) has run.
    fn is_valid(&self) -> bool;

    /// Shuts the port down: closes its descriptors, detaches it from
    /// every run loop and mode it was added to, and fires the
    /// invalidation broadcast. Idempotent.
    fn invalidate(&self);

    /// The registered delegate, if any.
    fn delegate(&self) -> Option<Rc<dyn PortDelegate>>;

    /// Registers (or clears) the delegate receiving messages.
    fn set_delegate(&self, delegate: Option<Rc<dyn PortDelegate>>);

    /// Bookkeeping hook invoked by [`RunLoop::add_port`].
    #[doc(hidden)]
    fn attached(&self, run_loop: &RunLoop, mode: &Mode);

    /// Bookkeeping hook invoked by [`RunLoop::remove_port`].
    #[doc(hidden)]
    fn detached(&self, run_loop: &RunLoop, mode: &Mode);
}

/// State common to every concrete port: identity, validity, delegate,
/// and the set of (run loop, mode) pairs the port is registered under.
pub(crate) struct PortCore {
    id: PortId,
    valid: Cell<bool>,
    delegate: RefCell<Option<Rc<dyn PortDelegate>>>,
    loops: RefCell<Vec<(WeakRunLoop, Mode)>>,
}

impl PortCore {
    pub(crate) fn new() -> Self {
        Self {
            id: PortId::next(),
            valid: Cell::new(true),
            delegate: RefCell::new(None),
            loops: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> PortId {
        self.id
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub(crate) fn delegate(&self) -> Option<Rc<dyn PortDelegate>> {
        self.delegate.borrow().clone()
    }

    pub(crate) fn set_delegate(&self, delegate: Option<Rc<dyn PortDelegate>>) {
        *self.delegate.borrow_mut() = delegate;
    }

    pub(crate) fn attached(&self, run_loop: &RunLoop, mode: &Mode) {
        let mut loops = self.loops.borrow_mut();
        let present = loops
            .iter()
            .any(|(weak, m)| m == mode && weak.upgrade().is_some_and(|rl| rl.same_loop(run_loop)));
        if !present {
            loops.push((run_loop.downgrade(), mode.clone()));
        }
    }

    pub(crate) fn detached(&self, run_loop: &RunLoop, mode: &Mode) {
        self.loops.borrow_mut().retain(|(weak, m)| {
            !(m == mode && weak.upgrade().is_some_and(|rl| rl.same_loop(run_loop)))
        });
    }

    /// First half of invalidation: flips the flag and detaches from every
    /// run loop. Returns `false` when the port was already invalid, in
    /// which case the caller must do nothing further.
    ///
    /// The caller closes its own descriptors and then calls
    /// [`finish_invalidate`](Self::finish_invalidate).
    pub(crate) fn begin_invalidate(&self) -> bool {
        if !self.valid.replace(false) {
            return false;
        }
        let loops = self.loops.take();
        for (weak, mode) in loops {
            if let Some(run_loop) = weak.upgrade() {
                run_loop.remove_watcher(
                    SourceIdent::Port(self.id),
                    WatchKind::PortMessage,
                    &mode,
                    true,
                );
            }
        }
        true
    }

    /// Second half of invalidation: fires the process-wide broadcast.
    pub(crate) fn finish_invalidate(&self) {
        tracing::debug!(port = self.id.0, "port invalidated");
        broadcast_invalidation(self.id);
    }
}

type Observer = std::sync::Arc<dyn Fn(PortId) + Send + Sync>;

static OBSERVERS: Mutex<Vec<(u64, Observer)>> = Mutex::new(Vec::new());
static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

/// Token identifying a registered invalidation observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(u64);

/// Registers a process-wide observer called once whenever any port is
/// invalidated, independent of that port's delegate.
pub fn observe_invalidation(observer: impl Fn(PortId) + Send + Sync + 'static) -> ObserverToken {
    let token = ObserverToken(NEXT_OBSERVER.fetch_add(1, Ordering::Relaxed));
    OBSERVERS.lock().push((token.0, std::sync::Arc::new(observer)));
    token
}

/// Removes a previously registered invalidation observer. Unknown tokens
/// are ignored.
pub fn remove_invalidation_observer(token: ObserverToken) {
    OBSERVERS.lock().retain(|(id, _)| *id != token.0);
}

fn broadcast_invalidation(id: PortId) {
    // Observers may themselves add or remove observers, so the lock is
    // never held across a callback: snapshot the list, then re-check each
    // token in case an earlier observer removed a later one.
    let observers: Vec<(u64, Observer)> = OBSERVERS.lock().clone();
    for (token, observer) in observers {
        let still_registered = OBSERVERS.lock().iter().any(|(t, _)| *t == token);
        if still_registered {
            observer(id);
        }
    }
}
