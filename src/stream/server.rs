//! Listening streams that accept connections as pre-opened pairs.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::{Error, ErrorKind, Result};
use crate::mode::Mode;
use crate::port::socket::LISTEN_BACKLOG;
use crate::run_loop::watcher::{SourceIdent, WatchEvent, WatchKind, Watcher};
use crate::run_loop::RunLoop;
use crate::stream::socket::pair_over;
use crate::stream::{InputStream, OutputStream, StreamEvent, StreamHandler, StreamShared, StreamStatus};

struct ServerInner {
    shared: StreamShared,
    listener: RefCell<Option<Socket>>,
}

/// A stream owning a listening socket.
///
/// Scheduled like any other stream; when a connection is pending the
/// handler receives [`StreamEvent::HasBytesAvailable`], and
/// [`accept`](ServerStream::accept) returns an already-open
/// (input, output) pair for it — the accepted side needed no
/// asynchronous open, so it never receives
/// [`StreamEvent::OpenCompleted`].
#[derive(Clone)]
pub struct ServerStream {
    inner: Rc<ServerInner>,
}

impl ServerStream {
    /// Binds a TCP listener at `addr`; it starts accepting on
    /// [`open`](Self::open).
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or bound.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        Ok(Self::over(socket))
    }

    /// Binds a Unix-domain listener at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or bound.
    pub fn bind_unix(path: &Path) -> Result<Self> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::unix(path)?)?;
        Ok(Self::over(socket))
    }

    fn over(socket: Socket) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                shared: StreamShared::new(StreamStatus::NotOpen),
                listener: RefCell::new(Some(socket)),
            }),
        }
    }

    /// The bound address, for TCP listeners. Useful after binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .borrow()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .and_then(|addr| addr.as_socket())
    }

    /// The stream's current status.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.inner.shared.status()
    }

    /// Takes the error that moved the stream to [`StreamStatus::Error`].
    #[must_use]
    pub fn take_error(&self) -> Option<Error> {
        self.inner.shared.take_error()
    }

    /// Sets (or clears) the handler notified of pending connections.
    pub fn set_handler(&self, handler: Option<Rc<dyn StreamHandler>>) {
        *self.inner.shared.handler.borrow_mut() = handler;
    }

    /// Starts listening. Synchronous; the handler is told on the spot.
    ///
    /// # Errors
    ///
    /// Fails on a state violation or if the listen call is refused.
    pub fn open(&self) -> Result<()> {
        if self.status() != StreamStatus::NotOpen {
            return Err(Error::new(ErrorKind::StreamState));
        }
        {
            let listener = self.inner.listener.borrow();
            let Some(socket) = listener.as_ref() else {
                return Err(Error::new(ErrorKind::StreamState));
            };
            socket.listen(LISTEN_BACKLOG)?;
        }
        self.inner.shared.set_status(StreamStatus::Open);
        for schedule in self.inner.shared.schedules.borrow_mut().iter_mut() {
            schedule.open_delivered = true;
        }
        if let Some(handler) = self.inner.shared.handler() {
            handler.on_event(StreamEvent::OpenCompleted);
        }
        Ok(())
    }

    /// Closes the listener and detaches it from every run loop.
    /// Idempotent.
    pub fn close(&self) {
        if self.status() == StreamStatus::Closed {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            self.inner.shared.unregister_watcher(fd, WatchKind::Readable);
        }
        self.inner.listener.borrow_mut().take();
        self.inner.shared.set_status(StreamStatus::Closed);
    }

    /// Accepts one pending connection, returning an already-open
    /// (input, output) pair over it, or `None` when nothing is pending.
    ///
    /// # Errors
    ///
    /// Fails on a non-open listener or on an accept-level I/O failure
    /// (which moves the stream to [`StreamStatus::Error`]).
    pub fn accept(&self) -> Result<Option<(InputStream, OutputStream)>> {
        if self.status() != StreamStatus::Open {
            return Err(Error::new(ErrorKind::StreamState));
        }
        loop {
            let accepted = {
                let listener = self.inner.listener.borrow();
                let Some(socket) = listener.as_ref() else {
                    return Err(Error::new(ErrorKind::StreamState));
                };
                socket.accept()
            };
            match accepted {
                Ok((socket, peer)) => {
                    socket.set_nonblocking(true)?;
                    tracing::debug!(
                        fd = socket.as_raw_fd(),
                        peer = ?peer.as_socket(),
                        "stream connection accepted"
                    );
                    return Ok(Some(pair_over(socket, false)));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.inner.shared.record_error(Error::new(ErrorKind::Io));
                    return Err(Error::io(ErrorKind::Io, err));
                }
            }
        }
    }

    /// Registers the listener as a source on (`run_loop`, `mode`).
    pub fn schedule(&self, run_loop: &RunLoop, mode: &Mode) {
        if !self.inner.shared.add_schedule(run_loop, mode) {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            let watcher: Rc<dyn Watcher> = self.inner.clone();
            run_loop.add_watcher(SourceIdent::Descriptor(fd), WatchKind::Readable, watcher, mode);
        }
    }

    /// Removes the registration added by [`schedule`](Self::schedule).
    pub fn remove_from_run_loop(&self, run_loop: &RunLoop, mode: &Mode) {
        if !self.inner.shared.remove_schedule(run_loop, mode) {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            run_loop.remove_watcher(SourceIdent::Descriptor(fd), WatchKind::Readable, mode, true);
        }
    }

    fn watch_fd(&self) -> Option<RawFd> {
        self.inner
            .listener
            .borrow()
            .as_ref()
            .map(AsRawFd::as_raw_fd)
    }
}

impl Watcher for ServerInner {
    fn ready(&self, run_loop: &RunLoop, mode: &Mode, event: WatchEvent) {
        let due = self
            .shared
            .due_events(run_loop, mode, event.readable, StreamEvent::HasBytesAvailable);
        if let Some(handler) = self.shared.handler() {
            for stream_event in due {
                handler.on_event(stream_event);
            }
        }
        if self.shared.terminal_drained() {
            self.shared.unregister_watcher(event.fd, WatchKind::Readable);
        }
    }

    fn descriptors(&self) -> Option<Vec<(RawFd, WatchKind)>> {
        let listener = self.listener.borrow();
        let Some(socket) = listener.as_ref() else {
            return Some(Vec::new());
        };
        let fd = socket.as_raw_fd();
        let set = match self.shared.status() {
            StreamStatus::Open => vec![(fd, WatchKind::Readable)],
            StreamStatus::AtEnd | StreamStatus::Error if !self.shared.terminal_drained() => {
                vec![(fd, WatchKind::Readable)]
            }
            _ => Vec::new(),
        };
        Some(set)
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("status", &self.status())
            .field("addr", &self.local_addr())
            .finish()
    }
}
