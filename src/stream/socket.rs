//! Socket-backed stream pairs.
//!
//! One connected socket backs both halves of a pair: the
//! [`InputStream`] reads from it, the [`OutputStream`] writes to it, and
//! each half tracks its own status over the shared descriptor. A
//! nonblocking connect leaves both halves `Opening`; whichever
//! scheduled run loop observes writability first resolves the connect,
//! and the other half picks the verdict up on its own next pass.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::rc::Rc;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::{Error, ErrorKind, Result};
use crate::stream::{InputStream, OutputStream, ReadOutcome, WriteOutcome};

/// The socket shared by the two halves of a stream pair.
pub(crate) struct SharedSocket {
    socket: Socket,
    connecting: Cell<bool>,
    /// Raw OS error of a failed connect, kept so both halves observe the
    /// same verdict (`take_error` only answers once).
    connect_failed: Cell<Option<i32>>,
}

impl SharedSocket {
    fn new(socket: Socket, connecting: bool) -> Rc<Self> {
        Rc::new(Self {
            socket,
            connecting: Cell::new(connecting),
            connect_failed: Cell::new(None),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn connecting(&self) -> bool {
        self.connecting.get()
    }

    /// Settles an in-flight connect once the descriptor reports
    /// writability.
    pub(crate) fn resolve_connect(&self) -> Result<()> {
        if let Some(code) = self.connect_failed.get() {
            return Err(Error::io(
                ErrorKind::ConnectionClosed,
                io::Error::from_raw_os_error(code),
            ));
        }
        if !self.connecting.get() {
            return Ok(());
        }
        match self.socket.take_error() {
            Ok(None) => {
                self.connecting.set(false);
                tracing::debug!(fd = self.fd(), "stream connect completed");
                Ok(())
            }
            Ok(Some(err)) | Err(err) => {
                self.connecting.set(false);
                self.connect_failed.set(err.raw_os_error());
                Err(Error::io(ErrorKind::ConnectionClosed, err))
            }
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            match (&self.socket).read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> Result<WriteOutcome> {
        loop {
            match (&self.socket).write(buf) {
                Ok(n) => return Ok(WriteOutcome::Accepted(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::WouldBlock)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Builds the (input, output) pair over an accepted or connected socket.
pub(crate) fn pair_over(socket: Socket, connecting: bool) -> (InputStream, OutputStream) {
    let shared = SharedSocket::new(socket, connecting);
    let pre_opened = !connecting;
    (
        InputStream::from_socket(shared.clone(), pre_opened),
        OutputStream::from_socket(shared, pre_opened),
    )
}

pub(crate) fn connect_to_host(addr: SocketAddr) -> Result<(InputStream, OutputStream)> {
    let domain = Domain::for_address(addr);
    connect_sockaddr(domain, &SockAddr::from(addr))
}

pub(crate) fn connect_unix(path: &Path) -> Result<(InputStream, OutputStream)> {
    connect_sockaddr(Domain::UNIX, &SockAddr::unix(path)?)
}

fn connect_sockaddr(domain: Domain, addr: &SockAddr) -> Result<(InputStream, OutputStream)> {
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    let connecting = match socket.connect(addr) {
        Ok(()) => false,
        Err(err) if connect_in_progress(&err) => true,
        Err(err) => return Err(err.into()),
    };
    let (input, output) = pair_over(socket, connecting);
    // An immediate connect still goes through open() for the state
    // machine, but completes synchronously there.
    Ok((input, output))
}

/// An anonymous, already-connected local pair. Both halves are
/// pre-opened.
pub(crate) fn pipe() -> Result<(InputStream, OutputStream)> {
    let (read_half, write_half) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
    read_half.set_nonblocking(true)?;
    write_half.set_nonblocking(true)?;
    let input = InputStream::from_socket(SharedSocket::new(read_half, false), true);
    let output = OutputStream::from_socket(SharedSocket::new(write_half, false), true);
    Ok((input, output))
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamStatus;

    #[test]
    fn test_pipe_round_trips_bytes() {
        let (input, output) = pipe().unwrap();
        assert_eq!(input.status(), StreamStatus::Open);
        assert_eq!(output.status(), StreamStatus::Open);

        assert_eq!(output.write(b"through the pipe").unwrap(), 16);
        let mut buf = [0u8; 32];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"through the pipe");
    }

    #[test]
    fn test_pipe_sees_eof_after_output_drops() {
        let (input, output) = pipe().unwrap();
        output.write(b"last").unwrap();
        drop(output);

        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).unwrap(), 4);
        assert_eq!(input.read(&mut buf).unwrap(), 0);
        assert_eq!(input.status(), StreamStatus::AtEnd);
    }
}
