//! File-backed stream backends.
//!
//! Plain blocking file I/O behind the generic state machine; these
//! backends register nothing with a run loop.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::error::Result;
use crate::stream::{ReadOutcome, WriteOutcome};

pub(crate) struct FileReader {
    path: PathBuf,
    file: Option<File>,
}

impl FileReader {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        self.file = Some(File::open(&self.path)?);
        Ok(())
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let Some(file) = self.file.as_mut() else {
            return Ok(ReadOutcome::Eof);
        };
        match file.read(buf)? {
            0 => Ok(ReadOutcome::Eof),
            n => Ok(ReadOutcome::Data(n)),
        }
    }
}

pub(crate) struct FileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl FileWriter {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        self.file = Some(File::create(&self.path)?);
        Ok(())
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome> {
        let Some(file) = self.file.as_mut() else {
            return Ok(WriteOutcome::WouldBlock);
        };
        let n = file.write(buf)?;
        Ok(WriteOutcome::Accepted(n))
    }
}
