//! In-memory stream backends.
//!
//! Always ready, never blocking; they sit outside the multiplexing
//! contract and only participate in the generic state machine.

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::stream::{ReadOutcome, WriteOutcome};

pub(crate) struct MemoryReader {
    data: Bytes,
    position: usize,
}

impl MemoryReader {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if self.remaining() == 0 {
            return Ok(ReadOutcome::Eof);
        }
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(ReadOutcome::Data(n))
    }
}

pub(crate) struct MemoryWriter {
    buffer: BytesMut,
    capacity: Option<usize>,
}

impl MemoryWriter {
    pub(crate) fn unbounded() -> Self {
        Self {
            buffer: BytesMut::new(),
            capacity: None,
        }
    }

    pub(crate) fn bounded(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    pub(crate) fn space_left(&self) -> usize {
        self.capacity
            .map_or(usize::MAX, |cap| cap - self.buffer.len())
    }

    pub(crate) fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome> {
        let space = self.space_left();
        if buf.len() <= space {
            self.buffer.extend_from_slice(buf);
            Ok(WriteOutcome::Accepted(buf.len()))
        } else {
            self.buffer.extend_from_slice(&buf[..space]);
            Ok(WriteOutcome::Full(space))
        }
    }
}
