//! Same-host message ports without network sockets.
//!
//! A [`MessagePort`] registers under a process-wide name; any thread can
//! resolve that name to a [`MessagePortSender`] and push messages. The
//! payload travels through an in-process queue, and a socketpair doorbell
//! gives the receiving run loop a descriptor to multiplex: a byte is
//! written per send, so the loop wakes, drains the doorbell, and delivers
//! the queued messages to the delegate inside its own pass. The port
//! object itself stays on its owning thread; only the sender half
//! crosses threads.

use std::collections::{HashMap, VecDeque};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::mode::Mode;
use crate::port::{Port, PortCore, PortDelegate, PortId, PortMessage};
use crate::run_loop::watcher::{WatchEvent, WatchKind, Watcher};
use crate::run_loop::RunLoop;

/// Sending half of a [`MessagePort`], resolved by name. Cloneable and
/// usable from any thread.
#[derive(Clone)]
pub struct MessagePortSender {
    queue: Arc<Mutex<VecDeque<Bytes>>>,
    doorbell: Arc<UnixStream>,
}

impl MessagePortSender {
    /// Queues one message for the receiving port and rings its doorbell.
    ///
    /// # Errors
    ///
    /// Fails when the receiving port has been invalidated (its doorbell
    /// is closed).
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.queue.lock().push_back(payload.into());
        match (&*self.doorbell).write(&[1]) {
            Ok(_) => Ok(()),
            // A full doorbell means the receiver is already plenty
            // readable; the queued message will drain with the rest.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(Error::io(ErrorKind::ConnectionClosed, err)),
        }
    }
}

impl std::fmt::Debug for MessagePortSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePortSender")
            .field("pending", &self.queue.lock().len())
            .finish()
    }
}

fn registry() -> &'static Mutex<HashMap<String, MessagePortSender>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, MessagePortSender>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A port delivering same-host messages through a named in-process
/// queue.
pub struct MessagePort {
    core: PortCore,
    name: String,
    queue: Arc<Mutex<VecDeque<Bytes>>>,
    doorbell: RefCell<Option<UnixStream>>,
}

impl MessagePort {
    /// Creates a port registered under `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::NameTaken`] when the name is already
    /// registered, or on socketpair creation failure.
    pub fn register(name: &str) -> Result<Rc<Self>> {
        let (write_end, read_end) = UnixStream::pair()?;
        write_end.set_nonblocking(true)?;
        read_end.set_nonblocking(true)?;
        let queue = Arc::new(Mutex::new(VecDeque::new()));

        {
            let mut names = registry().lock();
            if names.contains_key(name) {
                return Err(Error::with_detail(ErrorKind::NameTaken, name.to_owned()));
            }
            names.insert(
                name.to_owned(),
                MessagePortSender {
                    queue: queue.clone(),
                    doorbell: Arc::new(write_end),
                },
            );
        }

        tracing::debug!(name, "message port registered");
        Ok(Rc::new(Self {
            core: PortCore::new(),
            name: name.to_owned(),
            queue,
            doorbell: RefCell::new(Some(read_end)),
        }))
    }

    /// Resolves the sending half of the port registered under `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::PortLookup`] when no port holds the name.
    pub fn sender(name: &str) -> Result<MessagePortSender> {
        registry()
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::with_detail(ErrorKind::PortLookup, name.to_owned()))
    }

    /// The name this port is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages queued but not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queues a message to this port by name, from its own thread.
    ///
    /// # Errors
    ///
    /// Fails once the port is invalidated.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::invalid_port());
        }
        Self::sender(&self.name)?.send(payload)
    }
}

impl Watcher for MessagePort {
    fn ready(&self, _run_loop: &RunLoop, _mode: &Mode, _event: WatchEvent) {
        if !self.is_valid() {
            return;
        }
        {
            let doorbell = self.doorbell.borrow();
            let Some(stream) = doorbell.as_ref() else {
                return;
            };
            let mut scrap = [0u8; 64];
            loop {
                match (&*stream).read(&mut scrap) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        }
        let drained: Vec<Bytes> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::trace!(name = %self.name, count = drained.len(), "delivering messages");
        if let Some(delegate) = self.core.delegate() {
            for payload in drained {
                if !self.is_valid() {
                    break;
                }
                delegate.handle_message(PortMessage::new(payload, None));
            }
        }
    }

    fn descriptors(&self) -> Option<Vec<(RawFd, WatchKind)>> {
        Some(
            self.doorbell
                .borrow()
                .as_ref()
                .map(|stream| vec![(stream.as_raw_fd(), WatchKind::Readable)])
                .unwrap_or_default(),
        )
    }
}

impl Port for MessagePort {
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
        registry().lock().remove(&self.name);
        // Dropping the read end closes the doorbell; senders holding the
        // write half start failing.
        self.doorbell.borrow_mut().take();
        self.queue.lock().clear();
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

impl Drop for MessagePort {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.core.id())
            .field("name", &self.name)
            .field("valid", &self.core.is_valid())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_and_name_taken() {
        let port = MessagePort::register("test.register").unwrap();
        assert!(MessagePort::sender("test.register").is_ok());
        let err = MessagePort::register("test.register").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameTaken);

        port.invalidate();
        let err = MessagePort::sender("test.register").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PortLookup);
    }

    #[test]
    fn test_send_queues_until_delivered() {
        let port = MessagePort::register("test.queue").unwrap();
        let sender = MessagePort::sender("test.queue").unwrap();
        sender.send(Bytes::from_static(b"one")).unwrap();
        sender.send(Bytes::from_static(b"two")).unwrap();
        assert_eq!(port.pending(), 2);
        port.invalidate();
    }

    #[test]
    fn test_cross_thread_send() {
        let port = MessagePort::register("test.cross-thread").unwrap();
        let sender = MessagePort::sender("test.cross-thread").unwrap();
        std::thread::spawn(move || sender.send(Bytes::from_static(b"hi")).unwrap())
            .join()
            .unwrap();
        assert_eq!(port.pending(), 1);
        port.invalidate();
    }

    #[test]
    fn test_dropping_port_unregisters() {
        {
            let _port = MessagePort::register("test.drop").unwrap();
        }
        assert!(MessagePort::sender("test.drop").is_err());
    }
}
