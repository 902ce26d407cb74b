/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Resettable, forward-only views over byte regions.
//!
//! A [`DataSource`] is one of three realizations: a region of storage, a
//! memory buffer, or an ordered chain of other sources. All of them share the
//! same contract: `copy_to` moves exactly the requested number of bytes into
//! a [`DataSink`] and advances the position, or fails without guessing when
//! fewer bytes remain. Digest passes reset and replay views instead of seeking.

use crate::{
    error::{Result, SignerError},
    storage::BufferedStorage,
};
use ring::digest;
use std::{
    borrow::Cow,
    io::{self, Read, Write},
};

const TRANSFER_BUFFER_SIZE: usize = 4096;

fn end_of_data(msg: String) -> SignerError {
    SignerError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, msg))
}

/// Terminal consumer of bytes produced by a [`DataSource`].
pub trait DataSink {
    fn consume(&mut self, buf: &[u8]) -> Result<()>;
}

impl DataSink for digest::Context {
    fn consume(&mut self, buf: &[u8]) -> Result<()> {
        self.update(buf);
        Ok(())
    }
}

impl DataSink for Vec<u8> {
    fn consume(&mut self, buf: &[u8]) -> Result<()> {
        self.extend_from_slice(buf);
        Ok(())
    }
}

impl DataSink for BufferedStorage {
    fn consume(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        Ok(())
    }
}

/// Writes into a fixed slice; overrunning it is an end-of-data error.
pub struct SliceSink<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceSink<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl DataSink for SliceSink<'_> {
    fn consume(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.pos + buf.len();
        if end > self.data.len() {
            return Err(end_of_data(format!(
                "sink full: {} bytes offered at {} of {}",
                buf.len(),
                self.pos,
                self.data.len()
            )));
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }
}

/// Region `[start, start + size)` of a storage handle owned by this view.
pub struct StorageSource {
    storage: BufferedStorage,
    start: u64,
    size: u64,
    pos: u64,
}

impl StorageSource {
    pub fn new(storage: BufferedStorage, start: u64, size: u64) -> Self {
        Self {
            storage,
            start,
            size,
            pos: 0,
        }
    }

    fn copy_to(&mut self, sink: &mut dyn DataSink, length: u64) -> Result<()> {
        let remaining = self.size - self.pos;
        if length > remaining {
            return Err(end_of_data(format!(
                "storage region at {}: {} bytes requested, {} remaining",
                self.start + self.pos,
                length,
                remaining
            )));
        }
        let mut buf = [0u8; TRANSFER_BUFFER_SIZE];
        self.storage.seek_to(self.start + self.pos)?;
        let mut left = length;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            let n = self.storage.read(&mut buf[..want])?;
            if n == 0 {
                return Err(end_of_data(format!(
                    "storage '{}' ended {} bytes short",
                    self.storage.name(),
                    left
                )));
            }
            sink.consume(&buf[..n])?;
            left -= n as u64;
            self.pos += n as u64;
        }
        Ok(())
    }
}

/// Bytes `[start, start + size)` of an owned or borrowed buffer.
pub struct MemorySource<'a> {
    data: Cow<'a, [u8]>,
    start: usize,
    size: usize,
    pos: usize,
}

impl<'a> MemorySource<'a> {
    pub fn new(data: Cow<'a, [u8]>) -> Self {
        let size = data.len();
        Self {
            data,
            start: 0,
            size,
            pos: 0,
        }
    }

    pub fn with_range(data: Cow<'a, [u8]>, start: usize, size: usize) -> Result<Self> {
        if start.checked_add(size).map_or(true, |end| end > data.len()) {
            return Err(SignerError::Size(format!(
                "memory region {}+{} exceeds buffer of {} bytes",
                start,
                size,
                data.len()
            )));
        }
        Ok(Self {
            data,
            start,
            size,
            pos: 0,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.start..self.start + self.size]
    }

    /// Mutable access to the viewed bytes; a borrowed buffer is copied first.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let range = self.start..self.start + self.size;
        &mut self.data.to_mut()[range]
    }

    fn copy_to(&mut self, sink: &mut dyn DataSink, length: u64) -> Result<()> {
        let remaining = (self.size - self.pos) as u64;
        if length > remaining {
            return Err(end_of_data(format!(
                "memory region: {} bytes requested, {} remaining",
                length, remaining
            )));
        }
        let from = self.start + self.pos;
        let to = from + length as usize;
        sink.consume(&self.data[from..to])?;
        self.pos += length as usize;
        Ok(())
    }
}

/// Fixed, ordered concatenation of sources.
pub struct ChainedSource<'a> {
    sources: Vec<DataSource<'a>>,
    current: usize,
    size: u64,
    pos: u64,
}

impl<'a> ChainedSource<'a> {
    pub fn new(sources: Vec<DataSource<'a>>) -> Self {
        let size = sources.iter().map(DataSource::size).sum();
        Self {
            sources,
            current: 0,
            size,
            pos: 0,
        }
    }

    fn reset(&mut self) {
        self.current = 0;
        self.pos = 0;
        for source in &mut self.sources {
            source.reset();
        }
    }

    fn copy_to(&mut self, sink: &mut dyn DataSink, length: u64) -> Result<()> {
        let remaining = self.size - self.pos;
        if length > remaining {
            return Err(end_of_data(format!(
                "chained region: {} bytes requested, {} remaining",
                length, remaining
            )));
        }
        let mut left = length;
        while left > 0 {
            let active = &mut self.sources[self.current];
            let n = left.min(active.remaining());
            active.copy_to(sink, n)?;
            left -= n;
            self.pos += n;
            if active.remaining() == 0 && self.current + 1 < self.sources.len() {
                self.current += 1;
            }
        }
        Ok(())
    }
}

/// A resettable, forward-only cursor over a logical byte range.
pub enum DataSource<'a> {
    Storage(StorageSource),
    Memory(MemorySource<'a>),
    Chained(ChainedSource<'a>),
}

impl Default for DataSource<'_> {
    fn default() -> Self {
        DataSource::Memory(MemorySource::new(Cow::Owned(Vec::new())))
    }
}

impl<'a> DataSource<'a> {
    /// View over `[start, start + size)` of `storage`, read through its own
    /// read-only fragment so the caller's window is left untouched.
    pub fn from_storage(storage: &mut BufferedStorage, start: u64, size: u64) -> Result<Self> {
        let fragment = storage.new_fragment(start, size)?;
        Ok(DataSource::Storage(StorageSource::new(fragment, 0, size)))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        DataSource::Memory(MemorySource::new(Cow::Owned(data)))
    }

    pub fn from_slice(data: &'a [u8]) -> Self {
        DataSource::Memory(MemorySource::new(Cow::Borrowed(data)))
    }

    pub fn link(sources: Vec<DataSource<'a>>) -> Self {
        DataSource::Chained(ChainedSource::new(sources))
    }

    pub fn size(&self) -> u64 {
        match self {
            DataSource::Storage(s) => s.size,
            DataSource::Memory(m) => m.size as u64,
            DataSource::Chained(c) => c.size,
        }
    }

    pub fn pos(&self) -> u64 {
        match self {
            DataSource::Storage(s) => s.pos,
            DataSource::Memory(m) => m.pos as u64,
            DataSource::Chained(c) => c.pos,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.size() - self.pos()
    }

    pub fn reset(&mut self) {
        match self {
            DataSource::Storage(s) => s.pos = 0,
            DataSource::Memory(m) => m.pos = 0,
            DataSource::Chained(c) => c.reset(),
        }
    }

    pub fn reset_all(sources: &mut [&mut DataSource<'_>]) {
        for source in sources.iter_mut() {
            source.reset();
        }
    }

    /// Moves exactly `length` bytes into `sink`.
    pub fn copy_to(&mut self, sink: &mut dyn DataSink, length: u64) -> Result<()> {
        match self {
            DataSource::Storage(s) => s.copy_to(sink, length),
            DataSource::Memory(m) => m.copy_to(sink, length),
            DataSource::Chained(c) => c.copy_to(sink, length),
        }
    }

    pub fn copy_to_digest(&mut self, digest: &mut digest::Context, length: u64) -> Result<()> {
        self.copy_to(digest, length)
    }

    pub fn copy_to_storage(&mut self, storage: &mut BufferedStorage, length: u64) -> Result<()> {
        self.copy_to(storage, length)
    }

    /// Pads the view with zeros up to the next multiple of `alignment`.
    pub fn align(self, alignment: u64) -> Self {
        let over = self.size() % alignment;
        if over == 0 {
            return self;
        }
        let fill = vec![0u8; (alignment - over) as usize];
        DataSource::link(vec![self, DataSource::from_vec(fill)])
    }

    /// Copies the remaining bytes into a new memory view.
    pub fn to_memory(&mut self) -> Result<MemorySource<'static>> {
        let remaining = self.remaining();
        if remaining > i32::MAX as u64 {
            return Err(SignerError::Size(format!(
                "region of {} bytes is too large to hold in memory",
                remaining
            )));
        }
        let mut data = Vec::with_capacity(remaining as usize);
        self.copy_to(&mut data, remaining)?;
        Ok(MemorySource::new(Cow::Owned(data)))
    }

    /// Splits a chain back into its parts; any other view is returned alone.
    pub fn into_sources(self) -> Vec<DataSource<'a>> {
        match self {
            DataSource::Chained(c) => c.sources,
            other => vec![other],
        }
    }
}

impl<'a> From<MemorySource<'a>> for DataSource<'a> {
    fn from(memory: MemorySource<'a>) -> Self {
        DataSource::Memory(memory)
    }
}
