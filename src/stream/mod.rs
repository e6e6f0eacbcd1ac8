//! Byte-oriented read/write streams scheduled through the run loop.
//!
//! An [`InputStream`] or [`OutputStream`] wraps a memory buffer, a file,
//! or a socket behind one state machine:
//!
//! ```text
//! NotOpen -> Opening -> Open -> {Reading|Writing} -> {AtEnd|Error} -> Closed
//! ```
//!
//! Opening is synchronous for memory and file backends and asynchronous
//! for sockets, where completion is observed by a run loop and announced
//! with [`StreamEvent::OpenCompleted`]. A stream may be scheduled on any
//! number of (run loop, mode) pairs; every registration receives every
//! lifecycle event exactly once per occurrence. Partial reads and writes
//! are normal, never a fault; a terminal status accepts no further I/O.

mod file;
mod memory;
pub mod server;
pub mod socket;

pub use server::ServerStream;

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::{Error, ErrorKind, Result};
use crate::mode::Mode;
use crate::run_loop::watcher::{SourceIdent, WatchEvent, WatchKind, Watcher};
use crate::run_loop::{RunLoop, WeakRunLoop};

use file::{FileReader, FileWriter};
use memory::{MemoryReader, MemoryWriter};
use socket::SharedSocket;

/// Where a stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Created, not yet opened.
    NotOpen,
    /// Open requested; completion pending (socket connect in flight).
    Opening,
    /// Ready for I/O.
    Open,
    /// Momentarily inside a read call.
    Reading,
    /// Momentarily inside a write call.
    Writing,
    /// The source is exhausted (or the sink full); terminal.
    AtEnd,
    /// Explicitly closed; terminal.
    Closed,
    /// Failed; terminal. See [`InputStream::take_error`].
    Error,
}

impl StreamStatus {
    /// True for states that accept no further I/O.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::AtEnd | Self::Closed | Self::Error)
    }
}

/// A lifecycle occurrence delivered to a [`StreamHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// An asynchronous open finished.
    OpenCompleted,
    /// Bytes can be read without blocking (for a [`ServerStream`], a
    /// connection is ready to accept).
    HasBytesAvailable,
    /// Bytes can be written without blocking.
    HasSpaceAvailable,
    /// The stream hit its end.
    EndEncountered,
    /// The stream failed.
    ErrorOccurred,
}

/// Callback interface for scheduled streams.
pub trait StreamHandler {
    /// A lifecycle event occurred on the stream this handler is set on.
    fn on_event(&self, event: StreamEvent);
}

/// One (run loop, mode) registration and what it has been told so far.
struct Schedule {
    run_loop: WeakRunLoop,
    mode: Mode,
    open_delivered: bool,
    terminal_delivered: bool,
    /// Output only: suppresses repeat space events until a write blocks.
    space_delivered: bool,
}

/// State machine, handler, and scheduling bookkeeping shared by the
/// stream flavors.
struct StreamShared {
    status: Cell<StreamStatus>,
    handler: RefCell<Option<Rc<dyn StreamHandler>>>,
    schedules: RefCell<Vec<Schedule>>,
    error: RefCell<Option<Error>>,
}

impl StreamShared {
    fn new(status: StreamStatus) -> Self {
        Self {
            status: Cell::new(status),
            handler: RefCell::new(None),
            schedules: RefCell::new(Vec::new()),
            error: RefCell::new(None),
        }
    }

    fn status(&self) -> StreamStatus {
        self.status.get()
    }

    fn set_status(&self, status: StreamStatus) {
        self.status.set(status);
    }

    fn handler(&self) -> Option<Rc<dyn StreamHandler>> {
        self.handler.borrow().clone()
    }

    fn record_error(&self, error: Error) {
        tracing::debug!(error = %error, "stream failed");
        if !self.status().is_terminal() {
            self.set_status(StreamStatus::Error);
        }
        *self.error.borrow_mut() = Some(error);
    }

    fn take_error(&self) -> Option<Error> {
        self.error.borrow_mut().take()
    }

    /// Adds a registration; false when that (loop, mode) is already
    /// scheduled.
    fn add_schedule(&self, run_loop: &RunLoop, mode: &Mode) -> bool {
        let mut schedules = self.schedules.borrow_mut();
        let present = schedules.iter().any(|s| {
            s.mode == *mode && s.run_loop.upgrade().is_some_and(|rl| rl.same_loop(run_loop))
        });
        if present {
            return false;
        }
        schedules.push(Schedule {
            run_loop: run_loop.downgrade(),
            mode: mode.clone(),
            open_delivered: !matches!(self.status(), StreamStatus::NotOpen | StreamStatus::Opening),
            terminal_delivered: false,
            space_delivered: false,
        });
        true
    }

    fn remove_schedule(&self, run_loop: &RunLoop, mode: &Mode) -> bool {
        let mut schedules = self.schedules.borrow_mut();
        let before = schedules.len();
        schedules.retain(|s| {
            !(s.mode == *mode && s.run_loop.upgrade().is_some_and(|rl| rl.same_loop(run_loop)))
        });
        schedules.len() != before
    }

    /// Unhooks the watcher from every scheduled loop. Registrations stay
    /// recorded so a later `remove_from_run_loop` is still a no-op-safe
    /// bookkeeping call.
    fn unregister_watcher(&self, fd: RawFd, kind: WatchKind) {
        for schedule in self.schedules.borrow().iter() {
            if let Some(run_loop) = schedule.run_loop.upgrade() {
                run_loop.remove_watcher(SourceIdent::Descriptor(fd), kind, &schedule.mode, true);
            }
        }
    }

    /// Decides which events this pass owes the registrations matching
    /// (`run_loop`, `mode`), updating per-registration flags. `data_event`
    /// is what an open, non-terminal stream announces when its
    /// descriptor is ready.
    fn due_events(
        &self,
        run_loop: &RunLoop,
        mode: &Mode,
        data_ready: bool,
        data_event: StreamEvent,
    ) -> Vec<StreamEvent> {
        let status = self.status();
        let mut due = Vec::new();
        let mut schedules = self.schedules.borrow_mut();
        for schedule in schedules.iter_mut() {
            let matches_loop = schedule
                .run_loop
                .upgrade()
                .is_some_and(|rl| rl.same_loop(run_loop));
            if !matches_loop || (schedule.mode != *mode && !schedule.mode.is_common()) {
                continue;
            }
            match status {
                StreamStatus::Open | StreamStatus::Reading | StreamStatus::Writing => {
                    if !schedule.open_delivered {
                        schedule.open_delivered = true;
                        due.push(StreamEvent::OpenCompleted);
                    } else if data_ready {
                        if data_event == StreamEvent::HasSpaceAvailable {
                            if !schedule.space_delivered {
                                schedule.space_delivered = true;
                                due.push(data_event);
                            }
                        } else {
                            due.push(data_event);
                        }
                    }
                }
                StreamStatus::AtEnd if !schedule.terminal_delivered => {
                    schedule.terminal_delivered = true;
                    due.push(StreamEvent::EndEncountered);
                }
                StreamStatus::Error if !schedule.terminal_delivered => {
                    schedule.terminal_delivered = true;
                    due.push(StreamEvent::ErrorOccurred);
                }
                _ => {}
            }
        }
        due
    }

    /// True once no registration is still owed a terminal event.
    fn terminal_drained(&self) -> bool {
        self.status().is_terminal()
            && self
                .schedules
                .borrow()
                .iter()
                .all(|schedule| schedule.terminal_delivered)
    }

    /// Re-arms space announcements after a write filled the kernel
    /// buffer.
    fn reset_space_delivered(&self) {
        for schedule in self.schedules.borrow_mut().iter_mut() {
            schedule.space_delivered = false;
        }
    }
}

enum InputBackend {
    Memory(MemoryReader),
    File(FileReader),
    Socket(Rc<SharedSocket>),
}

enum OutputBackend {
    Memory(MemoryWriter),
    File(FileWriter),
    Socket(Rc<SharedSocket>),
}

struct InputInner {
    shared: StreamShared,
    backend: RefCell<InputBackend>,
}

struct OutputInner {
    shared: StreamShared,
    backend: RefCell<OutputBackend>,
}

/// A readable byte stream.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct InputStream {
    inner: Rc<InputInner>,
}

/// A writable byte stream.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct OutputStream {
    inner: Rc<OutputInner>,
}

impl InputStream {
    /// A stream reading from an in-memory buffer.
    #[must_use]
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::with_backend(InputBackend::Memory(MemoryReader::new(data.into())))
    }

    /// A stream reading from the file at `path`, opened lazily by
    /// [`open`](Self::open).
    #[must_use]
    pub fn from_file(path: impl Into<std::path::PathBuf>) -> Self {
        Self::with_backend(InputBackend::File(FileReader::new(path.into())))
    }

    fn with_backend(backend: InputBackend) -> Self {
        Self {
            inner: Rc::new(InputInner {
                shared: StreamShared::new(StreamStatus::NotOpen),
                backend: RefCell::new(backend),
            }),
        }
    }

    pub(crate) fn from_socket(socket: Rc<SharedSocket>, pre_opened: bool) -> Self {
        let status = if pre_opened {
            StreamStatus::Open
        } else {
            StreamStatus::NotOpen
        };
        Self {
            inner: Rc::new(InputInner {
                shared: StreamShared::new(status),
                backend: RefCell::new(InputBackend::Socket(socket)),
            }),
        }
    }

    /// Connects both byte-stream halves to the TCP listener at `addr`.
    ///
    /// The connect is asynchronous: after [`open`](Self::open), each
    /// scheduled registration receives [`StreamEvent::OpenCompleted`]
    /// once it completes.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connect is refused
    /// outright.
    pub fn connect_to_host(addr: SocketAddr) -> Result<(InputStream, OutputStream)> {
        socket::connect_to_host(addr)
    }

    /// Connects both byte-stream halves to the Unix-domain listener at
    /// `path`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connect is refused
    /// outright.
    pub fn connect_unix(path: &Path) -> Result<(InputStream, OutputStream)> {
        socket::connect_unix(path)
    }

    /// An anonymous, already-connected local pair: bytes written to the
    /// output half arrive on the input half. Both sides are pre-opened,
    /// so no [`StreamEvent::OpenCompleted`] is ever delivered for them.
    ///
    /// # Errors
    ///
    /// Fails if the socketpair cannot be created.
    pub fn pipe() -> Result<(InputStream, OutputStream)> {
        socket::pipe()
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

    /// Sets (or clears) the handler receiving lifecycle events.
    pub fn set_handler(&self, handler: Option<Rc<dyn StreamHandler>>) {
        *self.inner.shared.handler.borrow_mut() = handler;
    }

    /// Opens the stream.
    ///
    /// Memory and file backends open synchronously, announcing
    /// [`StreamEvent::OpenCompleted`] to the handler on the spot. A
    /// socket backend stays [`StreamStatus::Opening`] until its connect
    /// resolves on a scheduled run loop. Opening an already-open or
    /// terminal stream is a state error.
    ///
    /// # Errors
    ///
    /// Fails on a state violation or when the underlying file cannot be
    /// opened.
    pub fn open(&self) -> Result<()> {
        if self.status() != StreamStatus::NotOpen {
            return Err(Error::new(ErrorKind::StreamState));
        }
        let shared = &self.inner.shared;
        match &mut *self.inner.backend.borrow_mut() {
            InputBackend::Memory(_) => shared.set_status(StreamStatus::Open),
            InputBackend::File(reader) => {
                reader.open()?;
                shared.set_status(StreamStatus::Open);
            }
            InputBackend::Socket(socket) => {
                if socket.connecting() {
                    shared.set_status(StreamStatus::Opening);
                } else {
                    shared.set_status(StreamStatus::Open);
                }
            }
        }
        if self.status() == StreamStatus::Open {
            self.announce_sync_open();
        }
        Ok(())
    }

    fn announce_sync_open(&self) {
        let shared = &self.inner.shared;
        for schedule in shared.schedules.borrow_mut().iter_mut() {
            schedule.open_delivered = true;
        }
        if let Some(handler) = shared.handler() {
            handler.on_event(StreamEvent::OpenCompleted);
        }
    }

    /// Closes the stream and detaches it from every run loop it was
    /// scheduled on. Idempotent.
    pub fn close(&self) {
        if self.status() == StreamStatus::Closed {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            self.inner.shared.unregister_watcher(fd, WatchKind::Readable);
        }
        self.inner.shared.set_status(StreamStatus::Closed);
    }

    /// Reads up to `buf.len()` bytes.
    ///
    /// Fewer bytes than requested — including zero, when nothing is
    /// currently available — is normal. The stream reports exhaustion
    /// through [`StreamStatus::AtEnd`], not through a zero return alone.
    ///
    /// # Errors
    ///
    /// Fails on a closed or errored stream, or on an I/O failure (which
    /// also moves the stream to [`StreamStatus::Error`]).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.status() {
            StreamStatus::Open => {}
            StreamStatus::AtEnd => return Ok(0),
            _ => return Err(Error::new(ErrorKind::StreamState)),
        }
        let shared = &self.inner.shared;
        shared.set_status(StreamStatus::Reading);
        let outcome = match &mut *self.inner.backend.borrow_mut() {
            InputBackend::Memory(reader) => reader.read(buf),
            InputBackend::File(reader) => reader.read(buf),
            InputBackend::Socket(socket) => socket.read(buf),
        };
        match outcome {
            Ok(ReadOutcome::Data(n)) => {
                shared.set_status(StreamStatus::Open);
                Ok(n)
            }
            Ok(ReadOutcome::WouldBlock) => {
                shared.set_status(StreamStatus::Open);
                Ok(0)
            }
            Ok(ReadOutcome::Eof) => {
                shared.set_status(StreamStatus::AtEnd);
                Ok(0)
            }
            Err(err) => {
                shared.set_status(StreamStatus::Open);
                shared.record_error(err);
                Err(Error::new(ErrorKind::StreamClosed))
            }
        }
    }

    /// True when a read may return data without blocking; conservatively
    /// true when that cannot be known without a syscall.
    #[must_use]
    pub fn has_bytes_available(&self) -> bool {
        match self.status() {
            StreamStatus::Open | StreamStatus::Reading => {}
            _ => return false,
        }
        match &*self.inner.backend.borrow() {
            InputBackend::Memory(reader) => reader.remaining() > 0,
            // Only an attempted read can tell.
            InputBackend::File(_) | InputBackend::Socket(_) => true,
        }
    }

    /// Registers the stream's descriptor as a source on
    /// (`run_loop`, `mode`). Memory and file streams have no descriptor
    /// and record the registration without arming anything.
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
        match &*self.inner.backend.borrow() {
            InputBackend::Socket(socket) => Some(socket.fd()),
            InputBackend::Memory(_) | InputBackend::File(_) => None,
        }
    }
}

impl Watcher for InputInner {
    fn ready(&self, run_loop: &RunLoop, mode: &Mode, event: WatchEvent) {
        let fd = event.fd;
        if self.shared.status() == StreamStatus::Opening {
            let resolved = match &*self.backend.borrow() {
                InputBackend::Socket(socket) => socket.resolve_connect(),
                _ => Ok(()),
            };
            match resolved {
                Ok(()) => self.shared.set_status(StreamStatus::Open),
                Err(err) => self.shared.record_error(err),
            }
        }
        let due = self.shared.due_events(
            run_loop,
            mode,
            event.readable,
            StreamEvent::HasBytesAvailable,
        );
        if !due.is_empty() {
            if let Some(handler) = self.shared.handler() {
                for stream_event in due {
                    handler.on_event(stream_event);
                }
            }
        }
        if self.shared.terminal_drained() {
            self.shared.unregister_watcher(fd, WatchKind::Readable);
        }
    }

    fn descriptors(&self) -> Option<Vec<(RawFd, WatchKind)>> {
        let InputBackend::Socket(socket) = &*self.backend.borrow() else {
            return Some(Vec::new());
        };
        let fd = socket.fd();
        let set = match self.shared.status() {
            StreamStatus::Opening => vec![(fd, WatchKind::Writable)],
            StreamStatus::Open | StreamStatus::Reading => {
                let mut set = vec![(fd, WatchKind::Readable)];
                // A registration still owed OpenCompleted must not wait
                // for data; writability announces the open promptly.
                let owes_open = self
                    .shared
                    .schedules
                    .borrow()
                    .iter()
                    .any(|schedule| !schedule.open_delivered);
                if owes_open {
                    set.push((fd, WatchKind::Writable));
                }
                set
            }
            StreamStatus::AtEnd | StreamStatus::Error if !self.shared.terminal_drained() => {
                vec![(fd, WatchKind::Readable)]
            }
            _ => Vec::new(),
        };
        Some(set)
    }
}

impl OutputStream {
    /// A stream appending to a growable in-memory buffer; retrieve the
    /// written bytes with [`bytes`](Self::bytes).
    #[must_use]
    pub fn to_memory() -> Self {
        Self::with_backend(OutputBackend::Memory(MemoryWriter::unbounded()))
    }

    /// A stream writing into a fixed-capacity buffer; the stream reaches
    /// [`StreamStatus::AtEnd`] once `capacity` bytes are written.
    #[must_use]
    pub fn to_buffer(capacity: usize) -> Self {
        Self::with_backend(OutputBackend::Memory(MemoryWriter::bounded(capacity)))
    }

    /// A stream writing to the file at `path` (created or truncated on
    /// [`open`](Self::open)).
    #[must_use]
    pub fn to_file(path: impl Into<std::path::PathBuf>) -> Self {
        Self::with_backend(OutputBackend::File(FileWriter::new(path.into())))
    }

    fn with_backend(backend: OutputBackend) -> Self {
        Self {
            inner: Rc::new(OutputInner {
                shared: StreamShared::new(StreamStatus::NotOpen),
                backend: RefCell::new(backend),
            }),
        }
    }

    pub(crate) fn from_socket(socket: Rc<SharedSocket>, pre_opened: bool) -> Self {
        let status = if pre_opened {
            StreamStatus::Open
        } else {
            StreamStatus::NotOpen
        };
        Self {
            inner: Rc::new(OutputInner {
                shared: StreamShared::new(status),
                backend: RefCell::new(OutputBackend::Socket(socket)),
            }),
        }
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

    /// Sets (or clears) the handler receiving lifecycle events.
    pub fn set_handler(&self, handler: Option<Rc<dyn StreamHandler>>) {
        *self.inner.shared.handler.borrow_mut() = handler;
    }

    /// The bytes written so far, for memory-backed streams.
    #[must_use]
    pub fn bytes(&self) -> Option<Bytes> {
        match &*self.inner.backend.borrow() {
            OutputBackend::Memory(writer) => Some(writer.written()),
            _ => None,
        }
    }

    /// Opens the stream; see [`InputStream::open`] for the synchronous
    /// versus asynchronous split.
    ///
    /// # Errors
    ///
    /// Fails on a state violation or when the underlying file cannot be
    /// created.
    pub fn open(&self) -> Result<()> {
        if self.status() != StreamStatus::NotOpen {
            return Err(Error::new(ErrorKind::StreamState));
        }
        let shared = &self.inner.shared;
        match &mut *self.inner.backend.borrow_mut() {
            OutputBackend::Memory(_) => shared.set_status(StreamStatus::Open),
            OutputBackend::File(writer) => {
                writer.open()?;
                shared.set_status(StreamStatus::Open);
            }
            OutputBackend::Socket(socket) => {
                if socket.connecting() {
                    shared.set_status(StreamStatus::Opening);
                } else {
                    shared.set_status(StreamStatus::Open);
                }
            }
        }
        if self.status() == StreamStatus::Open {
            let shared = &self.inner.shared;
            for schedule in shared.schedules.borrow_mut().iter_mut() {
                schedule.open_delivered = true;
            }
            if let Some(handler) = shared.handler() {
                handler.on_event(StreamEvent::OpenCompleted);
            }
        }
        Ok(())
    }

    /// Closes the stream and detaches it from every run loop it was
    /// scheduled on. Idempotent.
    pub fn close(&self) {
        if self.status() == StreamStatus::Closed {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            self.inner.shared.unregister_watcher(fd, WatchKind::Writable);
        }
        self.inner.shared.set_status(StreamStatus::Closed);
    }

    /// Writes up to `buf.len()` bytes, returning how many were accepted.
    ///
    /// A short — even zero — write is normal when the sink cannot take
    /// more without blocking; schedule the stream and wait for
    /// [`StreamEvent::HasSpaceAvailable`].
    ///
    /// # Errors
    ///
    /// Fails on a closed, errored, or full stream, or on an I/O failure
    /// (which also moves the stream to [`StreamStatus::Error`]).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.status() {
            StreamStatus::Open => {}
            StreamStatus::AtEnd => return Err(Error::new(ErrorKind::StreamClosed)),
            _ => return Err(Error::new(ErrorKind::StreamState)),
        }
        let shared = &self.inner.shared;
        shared.set_status(StreamStatus::Writing);
        let outcome = match &mut *self.inner.backend.borrow_mut() {
            OutputBackend::Memory(writer) => writer.write(buf),
            OutputBackend::File(writer) => writer.write(buf),
            OutputBackend::Socket(socket) => socket.write(buf),
        };
        match outcome {
            Ok(WriteOutcome::Accepted(n)) => {
                shared.set_status(StreamStatus::Open);
                Ok(n)
            }
            Ok(WriteOutcome::WouldBlock) => {
                shared.set_status(StreamStatus::Open);
                shared.reset_space_delivered();
                Ok(0)
            }
            Ok(WriteOutcome::Full(n)) => {
                shared.set_status(StreamStatus::AtEnd);
                Ok(n)
            }
            Err(err) => {
                shared.set_status(StreamStatus::Open);
                shared.record_error(err);
                Err(Error::new(ErrorKind::StreamClosed))
            }
        }
    }

    /// True when a write may accept bytes without blocking;
    /// conservatively true when that cannot be known without a syscall.
    #[must_use]
    pub fn has_space_available(&self) -> bool {
        match self.status() {
            StreamStatus::Open | StreamStatus::Writing => {}
            _ => return false,
        }
        match &*self.inner.backend.borrow() {
            OutputBackend::Memory(writer) => writer.space_left() > 0,
            OutputBackend::File(_) | OutputBackend::Socket(_) => true,
        }
    }

    /// Registers the stream's descriptor as a source on
    /// (`run_loop`, `mode`).
    pub fn schedule(&self, run_loop: &RunLoop, mode: &Mode) {
        if !self.inner.shared.add_schedule(run_loop, mode) {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            let watcher: Rc<dyn Watcher> = self.inner.clone();
            run_loop.add_watcher(SourceIdent::Descriptor(fd), WatchKind::Writable, watcher, mode);
        }
    }

    /// Removes the registration added by [`schedule`](Self::schedule).
    pub fn remove_from_run_loop(&self, run_loop: &RunLoop, mode: &Mode) {
        if !self.inner.shared.remove_schedule(run_loop, mode) {
            return;
        }
        if let Some(fd) = self.watch_fd() {
            run_loop.remove_watcher(SourceIdent::Descriptor(fd), WatchKind::Writable, mode, true);
        }
    }

    fn watch_fd(&self) -> Option<RawFd> {
        match &*self.inner.backend.borrow() {
            OutputBackend::Socket(socket) => Some(socket.fd()),
            OutputBackend::Memory(_) | OutputBackend::File(_) => None,
        }
    }
}

impl Watcher for OutputInner {
    fn ready(&self, run_loop: &RunLoop, mode: &Mode, event: WatchEvent) {
        let fd = event.fd;
        if self.shared.status() == StreamStatus::Opening {
            let resolved = match &*self.backend.borrow() {
                OutputBackend::Socket(socket) => socket.resolve_connect(),
                _ => Ok(()),
            };
            match resolved {
                Ok(()) => self.shared.set_status(StreamStatus::Open),
                Err(err) => self.shared.record_error(err),
            }
        }
        let due = self.shared.due_events(
            run_loop,
            mode,
            event.writable,
            StreamEvent::HasSpaceAvailable,
        );
        if !due.is_empty() {
            if let Some(handler) = self.shared.handler() {
                for stream_event in due {
                    handler.on_event(stream_event);
                }
            }
        }
        if self.shared.terminal_drained() {
            self.shared.unregister_watcher(fd, WatchKind::Writable);
        }
    }

    fn descriptors(&self) -> Option<Vec<(RawFd, WatchKind)>> {
        let OutputBackend::Socket(socket) = &*self.backend.borrow() else {
            return Some(Vec::new());
        };
        let fd = socket.fd();
        let set = match self.shared.status() {
            StreamStatus::Opening => vec![(fd, WatchKind::Writable)],
            StreamStatus::Open | StreamStatus::Writing => {
                let owes_events = self.shared.schedules.borrow().iter().any(|schedule| {
                    !schedule.open_delivered || !schedule.space_delivered
                });
                if owes_events {
                    vec![(fd, WatchKind::Writable)]
                } else {
                    Vec::new()
                }
            }
            StreamStatus::AtEnd | StreamStatus::Error if !self.shared.terminal_drained() => {
                vec![(fd, WatchKind::Writable)]
            }
            _ => Vec::new(),
        };
        Some(set)
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("status", &self.status())
            .finish()
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("status", &self.status())
            .finish()
    }
}

/// What one backend read attempt produced.
pub(crate) enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

/// What one backend write attempt produced.
pub(crate) enum WriteOutcome {
    Accepted(usize),
    WouldBlock,
    /// Accepted `0..n` bytes and hit a hard capacity limit.
    Full(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct Recorder {
        events: StdRefCell<Vec<StreamEvent>>,
    }

    impl Recorder {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                events: StdRefCell::new(Vec::new()),
            })
        }
    }

    impl StreamHandler for Recorder {
        fn on_event(&self, event: StreamEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    #[test]
    fn test_memory_input_reads_to_end() {
        let stream = InputStream::from_data(&b"abcdef"[..]);
        assert_eq!(stream.status(), StreamStatus::NotOpen);
        stream.open().unwrap();
        assert_eq!(stream.status(), StreamStatus::Open);
        assert!(stream.has_bytes_available());

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.status(), StreamStatus::Open);

        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.status(), StreamStatus::AtEnd);
        assert!(!stream.has_bytes_available());
    }

    #[test]
    fn test_open_twice_is_a_state_error() {
        let stream = InputStream::from_data(&b"x"[..]);
        stream.open().unwrap();
        let err = stream.open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamState);
    }

    #[test]
    fn test_read_before_open_is_a_state_error() {
        let stream = InputStream::from_data(&b"x"[..]);
        let mut buf = [0u8; 1];
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            ErrorKind::StreamState
        );
    }

    #[test]
    fn test_closed_stream_rejects_io() {
        let stream = InputStream::from_data(&b"x"[..]);
        stream.open().unwrap();
        stream.close();
        assert_eq!(stream.status(), StreamStatus::Closed);
        let mut buf = [0u8; 1];
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            ErrorKind::StreamState
        );
        // Idempotent.
        stream.close();
    }

    #[test]
    fn test_memory_output_collects_written_bytes() {
        let stream = OutputStream::to_memory();
        stream.open().unwrap();
        assert!(stream.has_space_available());
        assert_eq!(stream.write(b"hello ").unwrap(), 6);
        assert_eq!(stream.write(b"world").unwrap(), 5);
        assert_eq!(&stream.bytes().unwrap()[..], b"hello world");
    }

    #[test]
    fn test_bounded_output_reaches_at_end() {
        let stream = OutputStream::to_buffer(4);
        stream.open().unwrap();
        assert_eq!(stream.write(b"abcdef").unwrap(), 4);
        assert_eq!(stream.status(), StreamStatus::AtEnd);
        assert!(stream.write(b"more").is_err());
        assert_eq!(&stream.bytes().unwrap()[..], b"abcd");
    }

    #[test]
    fn test_sync_open_announces_to_handler() {
        let recorder = Recorder::new();
        let stream = InputStream::from_data(&b"x"[..]);
        stream.set_handler(Some(recorder.clone()));
        stream.open().unwrap();
        assert_eq!(
            recorder.events.borrow().as_slice(),
            &[StreamEvent::OpenCompleted]
        );
    }
}
