//! Socket-backed ports over TCP or Unix-domain sockets.
//!
//! A [`SocketPort`] is either a listener — it accepts connections and
//! keeps a handle per live peer — or a connected client with a single
//! handle. Either way, delivery is message-oriented: bytes arriving on a
//! handle are buffered until a whole length-prefixed frame is present,
//! then handed to the delegate as one [`PortMessage`] carrying the
//! originating [`HandleId`]. Replies go back through
//! [`send_to`](SocketPort::send_to).
//!
//! A failure on one connection closes only that handle; the listener and
//! every other handle keep working.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::{Error, ErrorKind, Result};
use crate::mode::Mode;
use crate::port::frame::{FrameCodec, DEFAULT_MAX_FRAME_LEN};
use crate::port::{Port, PortCore, PortDelegate, PortId, PortMessage};
use crate::run_loop::watcher::{WatchEvent, WatchKind, Watcher};
use crate::run_loop::RunLoop;

/// Accept backlog advertised by every listener, sized for connection
/// bursts.
pub const LISTEN_BACKLOG: i32 = 10_000;

const READ_CHUNK: usize = 4096;

/// Identifies one live connection within a [`SocketPort`].
///
/// Valid only while the connection is open; sends to a closed handle
/// fail with [`ErrorKind::UnknownHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) RawFd);

/// Per-connection state, owned exclusively by the port that accepted or
/// initiated it.
struct Handle {
    socket: Socket,
    /// Nonblocking connect still in flight; resolved on writability.
    connecting: bool,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Handle {
    fn new(socket: Socket, connecting: bool, max_frame_len: usize) -> Self {
        Self {
            socket,
            connecting,
            codec: FrameCodec::with_max_frame_len(max_frame_len),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
        }
    }

    fn wants_write(&self) -> bool {
        self.connecting || !self.write_buf.is_empty()
    }

    /// Writes as much of the pending buffer as the socket accepts.
    fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Configuration for a [`SocketPort`].
#[derive(Debug, Clone)]
pub struct SocketPortBuilder {
    max_frame_len: usize,
    backlog: i32,
}

impl SocketPortBuilder {
    /// Rejects frames larger than this on both send and receive.
    #[must_use]
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Accept backlog for listener ports.
    #[must_use]
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Binds a TCP listener port on `addr`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or bound.
    pub fn listen(self, addr: SocketAddr) -> Result<Rc<SocketPort>> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(self.backlog)?;
        let port = SocketPort::from_listener(socket, self.max_frame_len);
        if let Some(local) = port.local_addr() {
            registry_insert(&port, RegistryKey::Listener(local));
        }
        Ok(port)
    }

    /// Binds a Unix-domain listener port at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or bound.
    pub fn listen_unix(self, path: &Path) -> Result<Rc<SocketPort>> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(self.backlog)?;
        Ok(SocketPort::from_listener(socket, self.max_frame_len))
    }

    /// Connects a client port to the TCP listener at `addr`.
    ///
    /// The connect is nonblocking; buffered sends flush once it
    /// completes. An already-registered port for `addr` is returned
    /// instead of opening a second connection.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connect is refused
    /// outright.
    pub fn connect(self, addr: SocketAddr) -> Result<Rc<SocketPort>> {
        if let Some(existing) = registry_lookup(RegistryKey::Sender(addr)) {
            return Ok(existing);
        }
        let domain = Domain::for_address(addr);
        let port = self.connect_sockaddr(domain, &SockAddr::from(addr))?;
        registry_insert(&port, RegistryKey::Sender(addr));
        Ok(port)
    }

    /// Connects a client port to the Unix-domain listener at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connect is refused
    /// outright.
    pub fn connect_unix(self, path: &Path) -> Result<Rc<SocketPort>> {
        self.connect_sockaddr(Domain::UNIX, &SockAddr::unix(path)?)
    }

    fn connect_sockaddr(self, domain: Domain, addr: &SockAddr) -> Result<Rc<SocketPort>> {
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        let connecting = match socket.connect(addr) {
            Ok(()) => false,
            Err(err) if connect_in_progress(&err) => true,
            Err(err) => return Err(err.into()),
        };
        Ok(SocketPort::from_connection(
            socket,
            connecting,
            self.max_frame_len,
        ))
    }
}

impl Default for SocketPortBuilder {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            backlog: LISTEN_BACKLOG,
        }
    }
}

/// A message port over TCP or Unix-domain stream sockets.
pub struct SocketPort {
    core: PortCore,
    listener: RefCell<Option<Socket>>,
    handles: RefCell<HashMap<RawFd, Handle>>,
    max_frame_len: usize,
    registered_as: RefCell<Option<RegistryKey>>,
}

impl SocketPort {
    /// Returns a builder for configuring frame cap and backlog.
    #[must_use]
    pub fn builder() -> SocketPortBuilder {
        SocketPortBuilder::default()
    }

    /// Binds a TCP listener port on `addr` with default settings.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or bound.
    pub fn listen(addr: SocketAddr) -> Result<Rc<Self>> {
        Self::builder().listen(addr)
    }

    /// Binds a Unix-domain listener port at `path` with default settings.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or bound.
    pub fn listen_unix(path: &Path) -> Result<Rc<Self>> {
        Self::builder().listen_unix(path)
    }

    /// Connects a client port to `addr` with default settings, reusing
    /// an already-registered port for that address.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connect is refused.
    pub fn connect(addr: SocketAddr) -> Result<Rc<Self>> {
        Self::builder().connect(addr)
    }

    /// Connects a client port to the Unix-domain listener at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connect is refused.
    pub fn connect_unix(path: &Path) -> Result<Rc<Self>> {
        Self::builder().connect_unix(path)
    }

    /// Resolves an already-created port registered for `addr` on this
    /// thread, if it is still valid: the listener bound to it, or
    /// otherwise a client port connected to it.
    #[must_use]
    pub fn existing(addr: SocketAddr) -> Option<Rc<Self>> {
        registry_lookup(RegistryKey::Listener(addr))
            .or_else(|| registry_lookup(RegistryKey::Sender(addr)))
    }

    fn from_listener(socket: Socket, max_frame_len: usize) -> Rc<Self> {
        tracing::debug!(fd = socket.as_raw_fd(), "socket port listening");
        Rc::new(Self {
            core: PortCore::new(),
            listener: RefCell::new(Some(socket)),
            handles: RefCell::new(HashMap::new()),
            max_frame_len,
            registered_as: RefCell::new(None),
        })
    }

    fn from_connection(socket: Socket, connecting: bool, max_frame_len: usize) -> Rc<Self> {
        let fd = socket.as_raw_fd();
        tracing::debug!(fd, connecting, "socket port connecting");
        let port = Rc::new(Self {
            core: PortCore::new(),
            listener: RefCell::new(None),
            handles: RefCell::new(HashMap::new()),
            max_frame_len,
            registered_as: RefCell::new(None),
        });
        port.handles
            .borrow_mut()
            .insert(fd, Handle::new(socket, connecting, max_frame_len));
        port
    }

    /// The listener's bound address, for TCP listener ports. Useful after
    /// binding port 0 to learn the OS-assigned port.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .borrow()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .and_then(|addr| addr.as_socket())
    }

    /// Number of live connection handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.borrow().len()
    }

    /// Sends one framed message on a client port's single connection.
    ///
    /// Listener ports with several live handles must name one with
    /// [`send_to`](Self::send_to).
    ///
    /// # Errors
    ///
    /// Fails on an invalidated port, when there is no live connection,
    /// when the connection choice is ambiguous, or on frame/I/O errors.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let handle = {
            let handles = self.handles.borrow();
            let mut ids = handles.keys();
            match (ids.next(), ids.next()) {
                (Some(&fd), None) => HandleId(fd),
                (None, _) => return Err(Error::new(ErrorKind::ConnectionClosed)),
                (Some(_), Some(_)) => {
                    return Err(Error::with_detail(
                        ErrorKind::UnknownHandle,
                        "several live connections; use send_to",
                    ))
                }
            }
        };
        self.send_to(handle, payload)
    }

    /// Sends one framed message on the named connection.
    ///
    /// The write is nonblocking; whatever the socket does not accept
    /// immediately is buffered and flushed when the connection becomes
    /// writable in a later pass.
    ///
    /// # Errors
    ///
    /// Fails on an invalidated port, an unknown handle, an oversized
    /// frame, or a connection-level I/O error (which also closes the
    /// handle).
    pub fn send_to(&self, handle: HandleId, payload: &[u8]) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::invalid_port());
        }
        let flush_result = {
            let mut handles = self.handles.borrow_mut();
            let Some(entry) = handles.get_mut(&handle.0) else {
                return Err(Error::new(ErrorKind::UnknownHandle));
            };
            entry.codec.encode(payload, &mut entry.write_buf)?;
            if entry.connecting {
                Ok(())
            } else {
                entry.flush()
            }
        };
        match flush_result {
            Ok(()) => Ok(()),
            Err(err) => {
                let error = Error::io(ErrorKind::ConnectionClosed, err);
                self.close_handle(handle.0, Some(&error));
                Err(error)
            }
        }
    }

    /// Accepts every pending connection on the listener.
    fn service_listener(&self) {
        let mut fatal: Option<io::Error> = None;
        loop {
            let accepted = {
                let listener = self.listener.borrow();
                let Some(socket) = listener.as_ref() else {
                    return;
                };
                socket.accept()
            };
            match accepted {
                Ok((socket, peer)) => {
                    if socket.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let fd = socket.as_raw_fd();
                    tracing::debug!(fd, peer = ?peer.as_socket(), "connection accepted");
                    self.handles
                        .borrow_mut()
                        .insert(fd, Handle::new(socket, false, self.max_frame_len));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = fatal {
            // A broken listener takes the whole port down; its live
            // handles are closed with it.
            let error = Error::io(ErrorKind::Io, err);
            tracing::warn!(error = %error, "listener failed; invalidating port");
            self.invalidate();
            if let Some(delegate) = self.core.delegate() {
                delegate.handle_error(&error);
            }
        }
    }

    /// Resolves a pending connect and flushes buffered writes.
    fn service_writable(&self, fd: RawFd) {
        let outcome = {
            let mut handles = self.handles.borrow_mut();
            let Some(handle) = handles.get_mut(&fd) else {
                return;
            };
            if handle.connecting {
                match handle.socket.take_error() {
                    Ok(None) => {
                        handle.connecting = false;
                        tracing::debug!(fd, "connect completed");
                    }
                    Ok(Some(err)) | Err(err) => {
                        drop(handles);
                        let error = Error::io(ErrorKind::ConnectionClosed, err);
                        self.close_handle(fd, Some(&error));
                        return;
                    }
                }
            }
            handle.flush()
        };
        if let Err(err) = outcome {
            let error = Error::io(ErrorKind::ConnectionClosed, err);
            self.close_handle(fd, Some(&error));
        }
    }

    /// Reads whatever the socket holds and delivers each completed frame.
    fn service_readable(&self, fd: RawFd) {
        enum Shutdown {
            Eof,
            Failed(Error),
        }

        let mut frames: Vec<Bytes> = Vec::new();
        let mut shutdown: Option<Shutdown> = None;
        {
            let mut handles = self.handles.borrow_mut();
            let Some(handle) = handles.get_mut(&fd) else {
                return;
            };
            let mut chunk = [0u8; READ_CHUNK];
            'read: loop {
                match handle.socket.read(&mut chunk) {
                    Ok(0) => {
                        shutdown = Some(Shutdown::Eof);
                        break;
                    }
                    Ok(n) => {
                        handle.read_buf.extend_from_slice(&chunk[..n]);
                        loop {
                            match handle.codec.decode(&mut handle.read_buf) {
                                Ok(Some(frame)) => frames.push(frame),
                                Ok(None) => break,
                                Err(err) => {
                                    shutdown = Some(Shutdown::Failed(err));
                                    break 'read;
                                }
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        shutdown =
                            Some(Shutdown::Failed(Error::io(ErrorKind::ConnectionClosed, err)));
                        break;
                    }
                }
            }
        }

        // Frames completed before a shutdown are still delivered, each as
        // its own message.
        let delegate = self.core.delegate();
        if let Some(delegate) = &delegate {
            for frame in frames {
                delegate.handle_message(PortMessage::new(frame, Some(HandleId(fd))));
            }
        }
        match shutdown {
            Some(Shutdown::Eof) => self.close_handle(fd, None),
            Some(Shutdown::Failed(error)) => self.close_handle(fd, Some(&error)),
            None => {}
        }
    }

    /// Removes a handle from the table; the descriptor closes with it and
    /// is never left stale.
    fn close_handle(&self, fd: RawFd, error: Option<&Error>) {
        let removed = self.handles.borrow_mut().remove(&fd);
        if removed.is_none() {
            return;
        }
        tracing::debug!(fd, failed = error.is_some(), "connection closed");
        if let Some(error) = error {
            if let Some(delegate) = self.core.delegate() {
                delegate.handle_error(error);
            }
        }
    }
}

impl Watcher for SocketPort {
    fn ready(&self, _run_loop: &RunLoop, _mode: &Mode, event: WatchEvent) {
        if !self.is_valid() {
            return;
        }
        let is_listener = self
            .listener
            .borrow()
            .as_ref()
            .is_some_and(|socket| socket.as_raw_fd() == event.fd);
        if is_listener {
            if event.readable {
                self.service_listener();
            }
            return;
        }
        if event.writable {
            self.service_writable(event.fd);
        }
        if event.readable {
            self.service_readable(event.fd);
        }
    }

    fn descriptors(&self) -> Option<Vec<(RawFd, WatchKind)>> {
        let mut set = Vec::new();
        if let Some(listener) = self.listener.borrow().as_ref() {
            set.push((listener.as_raw_fd(), WatchKind::Readable));
        }
        for (&fd, handle) in self.handles.borrow().iter() {
            set.push((fd, WatchKind::Readable));
            if handle.wants_write() {
                set.push((fd, WatchKind::Writable));
            }
        }
        Some(set)
    }
}

impl Port for SocketPort {
    fn id(&self) -> PortId {
        self.core.id()
    }

    fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    fn invalidate(&self) {
        if !self.core.begin_invalidate() {
            return;
        }
        if let Some(key) = self.registered_as.borrow_mut().take() {
            REGISTRY.with_borrow_mut(|registry| {
                registry.map_for(key).remove(&key.addr());
            });
        }
        // Dropping the sockets closes every descriptor.
        self.listener.borrow_mut().take();
        self.handles.borrow_mut().clear();
        self.core.finish_invalidate();
    }

    fn delegate(&self) -> Option<Rc<dyn PortDelegate>> {
        self.core.delegate()
    }

    fn set_delegate(&self, delegate: Option<Rc<dyn PortDelegate>>) {
        self.core.set_delegate(delegate);
    }

    fn attached(&self, run_loop: &RunLoop, mode: &Mode) {
        self.core.attached(run_loop, mode);
    }

    fn detached(&self, run_loop: &RunLoop, mode: &Mode) {
        self.core.detached(run_loop, mode);
    }
}

impl Drop for SocketPort {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for SocketPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPort")
            .field("id", &self.core.id())
            .field("valid", &self.core.is_valid())
            .field("listener", &self.local_addr())
            .field("handles", &self.handles.borrow().len())
            .finish()
    }
}

/// How a port is known to the registry: a listener under its bound
/// address, or a client port under the remote address it connects to.
/// The two namespaces are separate, so connecting to an address this
/// process listens on still opens a real connection.
#[derive(Debug, Clone, Copy)]
enum RegistryKey {
    Listener(SocketAddr),
    Sender(SocketAddr),
}

impl RegistryKey {
    fn addr(self) -> SocketAddr {
        match self {
            Self::Listener(addr) | Self::Sender(addr) => addr,
        }
    }
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<SocketAddr, Weak<SocketPort>>,
    senders: HashMap<SocketAddr, Weak<SocketPort>>,
}

impl Registry {
    fn map_for(&mut self, key: RegistryKey) -> &mut HashMap<SocketAddr, Weak<SocketPort>> {
        match key {
            RegistryKey::Listener(_) => &mut self.listeners,
            RegistryKey::Sender(_) => &mut self.senders,
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

fn registry_insert(port: &Rc<SocketPort>, key: RegistryKey) {
    *port.registered_as.borrow_mut() = Some(key);
    REGISTRY.with_borrow_mut(|registry| {
        registry.map_for(key).insert(key.addr(), Rc::downgrade(port));
    });
}

fn registry_lookup(key: RegistryKey) -> Option<Rc<SocketPort>> {
    REGISTRY.with_borrow_mut(|registry| {
        let map = registry.map_for(key);
        map.retain(|_, weak| weak.upgrade().is_some_and(|p| p.is_valid()));
        map.get(&key.addr()).and_then(Weak::upgrade)
    })
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}
