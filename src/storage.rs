/*
 * ApkSigBlock v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Buffered random-access storage.
//!
//! [`BufferedStorage`] keeps a single 128 KiB window over a backing medium
//! ([`RandomAccessData`]) so that the backward EOCD scan, the digest passes
//! and the final splice touch the disk as rarely as possible. The window is
//! always aligned to its own size; the physical cursor is only moved when it
//! differs from where the next refill or flush needs it.
//!
//! A storage handle has exactly one owner. Independent read-only views are
//! obtained through [`BufferedStorage::new_fragment`], which opens a fresh
//! handle on the same medium instead of sharing the writer's window.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub const WINDOW_SHIFT: u32 = 17;
pub const WINDOW_SIZE: usize = 1 << WINDOW_SHIFT;
const WINDOW_MASK: u64 = !((WINDOW_SIZE as u64) - 1);

/// Raw, unbuffered random-access medium underneath a [`BufferedStorage`].
pub trait RandomAccessData {
    fn seek(&mut self, pos: u64) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes; `Ok(0)` means end of medium.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    fn length(&mut self) -> io::Result<u64>;

    fn set_length(&mut self, new_length: u64) -> io::Result<()>;

    fn position(&mut self) -> io::Result<u64>;

    fn sync(&mut self) -> io::Result<()>;

    fn name(&self) -> String;

    /// Opens an independent handle on the same medium.
    fn new_same_instance(&self) -> io::Result<Box<dyn RandomAccessData>>;

    /// Opens an independent, read-only handle restricted to `[offset, offset + length)`.
    fn new_fragment(&self, offset: u64, length: u64) -> io::Result<Box<dyn RandomAccessData>> {
        let fragment = FragmentData::new(self.new_same_instance()?, offset, length)?;
        Ok(Box::new(fragment))
    }
}

/// A file on disk.
pub struct FileData {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl FileData {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        Ok(Self {
            file,
            path,
            writable,
        })
    }
}

impl RandomAccessData for FileData {
    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_length(&mut self, new_length: u64) -> io::Result<()> {
        self.file.set_len(new_length)
    }

    fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn new_same_instance(&self) -> io::Result<Box<dyn RandomAccessData>> {
        Ok(Box::new(FileData::open(&self.path, self.writable)?))
    }
}

/// Read-only window `[offset, offset + length)` of another medium, addressed from zero.
pub struct FragmentData {
    inner: Box<dyn RandomAccessData>,
    offset: u64,
    length: u64,
    pos: u64,
}

impl FragmentData {
    pub fn new(mut inner: Box<dyn RandomAccessData>, offset: u64, length: u64) -> io::Result<Self> {
        let data_length = inner.length()?;
        let end = offset.checked_add(length);
        if end.map_or(true, |end| end > data_length) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "fragment.offset={}, fragment.length={}, data.length={}",
                    offset, length, data_length
                ),
            ));
        }
        let mut fragment = Self {
            inner,
            offset,
            length,
            pos: 0,
        };
        RandomAccessData::seek(&mut fragment, 0)?;
        Ok(fragment)
    }

    fn read_only() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "fragment is read-only")
    }
}

impl RandomAccessData for FragmentData {
    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.inner.seek(pos + self.offset)?;
        self.pos = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.length.saturating_sub(self.pos);
        if available == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(available.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..len])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<()> {
        Err(Self::read_only())
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.length)
    }

    fn set_length(&mut self, _new_length: u64) -> io::Result<()> {
        Err(Self::read_only())
    }

    fn position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }

    fn name(&self) -> String {
        format!(
            "{}-Fragment({},{})",
            self.inner.name(),
            self.offset,
            self.length
        )
    }

    fn new_same_instance(&self) -> io::Result<Box<dyn RandomAccessData>> {
        let fragment = FragmentData::new(self.inner.new_same_instance()?, self.offset, self.length)?;
        Ok(Box::new(fragment))
    }
}

/// Seekable byte storage with one fixed-size cache window.
///
/// Invariants:
/// - `lo` is a multiple of [`WINDOW_SIZE`] and `max_hi == lo + WINDOW_SIZE`.
/// - `window[..hi - lo]` mirrors the medium, except for dirty bytes in `[lo, curr)`.
/// - `hit_eof` is true when the last refill came up short of a full window.
/// - Moving `curr` backwards always flushes first, so a flush writing
///   `[lo, curr)` never drops bytes written earlier in the same window.
pub struct BufferedStorage {
    data: Box<dyn RandomAccessData>,
    window: Box<[u8]>,
    dirty: bool,
    closed: bool,
    curr: u64,
    lo: u64,
    hi: u64,
    max_hi: u64,
    hit_eof: bool,
    disk_pos: u64,
    data_length: Option<u64>,
}

impl BufferedStorage {
    pub fn new(data: Box<dyn RandomAccessData>) -> Self {
        Self {
            data,
            window: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
            dirty: false,
            closed: false,
            curr: 0,
            lo: 0,
            hi: 0,
            max_hi: WINDOW_SIZE as u64,
            hit_eof: false,
            disk_pos: 0,
            data_length: None,
        }
    }

    /// Opens `path` for reading, and for writing too when `writable` is set.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> io::Result<Self> {
        Ok(Self::new(Box::new(FileData::open(path, writable)?)))
    }

    pub fn name(&self) -> String {
        self.data.name()
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.curr
    }

    pub fn length(&mut self) -> io::Result<u64> {
        let data_length = match self.data_length {
            Some(len) => len,
            None => {
                let len = self.data.length()?;
                self.data_length = Some(len);
                len
            }
        };
        Ok(self.curr.max(data_length))
    }

    /// Flushes, truncates or extends the medium, then realigns the window.
    pub fn set_length(&mut self, new_length: u64) -> io::Result<()> {
        self.flush_window()?;
        self.data.set_length(new_length)?;
        self.data_length = Some(new_length);
        if self.curr > new_length {
            self.curr = new_length;
        }
        if self.disk_pos > new_length {
            self.data.seek(new_length)?;
            self.disk_pos = new_length;
        }
        self.lo = 0;
        self.hi = 0;
        self.seek_to(self.curr)
    }

    /// Positions the logical cursor at `pos`, refilling the window if `pos`
    /// falls outside it.
    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        if pos >= self.hi || pos < self.lo {
            self.flush_window()?;
            self.lo = pos & WINDOW_MASK;
            self.max_hi = self.lo + WINDOW_SIZE as u64;
            if self.disk_pos != self.lo {
                self.data.seek(self.lo)?;
                self.disk_pos = self.lo;
            }
            let n = self.fill_window()?;
            self.hi = self.lo + n as u64;
        } else if pos < self.curr {
            self.flush_window()?;
        }
        self.curr = pos;
        Ok(())
    }

    /// Derives an independent read-only storage over `[offset, offset + length)`.
    pub fn new_fragment(&mut self, offset: u64, length: u64) -> io::Result<BufferedStorage> {
        self.flush_window()?;
        Ok(BufferedStorage::new(self.data.new_fragment(offset, length)?))
    }

    /// Flushes the window and asks the medium to persist its contents.
    pub fn sync(&mut self) -> io::Result<()> {
        self.flush_window()?;
        self.data.sync()
    }

    pub fn close(mut self) -> io::Result<()> {
        self.flush_window()?;
        self.closed = true;
        Ok(())
    }

    fn flush_window(&mut self) -> io::Result<()> {
        if self.dirty {
            if self.disk_pos != self.lo {
                self.data.seek(self.lo)?;
            }
            let len = (self.curr - self.lo) as usize;
            self.data.write(&self.window[..len])?;
            self.disk_pos = self.curr;
            self.dirty = false;
            if matches!(self.data_length, Some(len) if self.disk_pos > len) {
                self.data_length = None;
            }
        }
        Ok(())
    }

    fn fill_window(&mut self) -> io::Result<usize> {
        let mut count = 0;
        while count < self.window.len() {
            let n = self.data.read(&mut self.window[count..])?;
            if n == 0 {
                break;
            }
            count += n;
        }
        self.hit_eof = count < self.window.len();
        if self.hit_eof {
            self.window[count..].fill(0);
        }
        self.disk_pos += count as u64;
        Ok(count)
    }

    fn write_at_most(&mut self, src: &[u8]) -> io::Result<usize> {
        let appending = self.hit_eof && self.curr < self.max_hi;
        if self.curr >= self.hi && !appending {
            self.seek_to(self.curr)?;
        }
        let limit = if self.hit_eof { self.max_hi } else { self.hi };
        let len = src.len().min((limit - self.curr) as usize);
        let off = (self.curr - self.lo) as usize;
        self.window[off..off + len].copy_from_slice(&src[..len]);
        self.curr += len as u64;
        if self.curr > self.hi {
            self.hi = self.curr;
        }
        self.dirty = true;
        Ok(len)
    }
}

impl Read for BufferedStorage {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.curr >= self.hi {
            if self.hit_eof {
                return Ok(0);
            }
            self.seek_to(self.curr)?;
            if self.curr >= self.hi {
                return Ok(0);
            }
        }
        let len = out.len().min((self.hi - self.curr) as usize);
        let off = (self.curr - self.lo) as usize;
        out[..len].copy_from_slice(&self.window[off..off + len]);
        self.curr += len as u64;
        Ok(len)
    }
}

impl Write for BufferedStorage {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        self.write_at_most(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_window()
    }
}

impl Seek for BufferedStorage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.curr.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length()?.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )
        })?;
        self.seek_to(target)?;
        Ok(target)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.curr)
    }
}

impl Drop for BufferedStorage {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.flush_window();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    fn scratch(len: usize) -> (TempDir, PathBuf, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.bin");
        let content = pattern(len, 7);
        fs::write(&path, &content).unwrap();
        (dir, path, content)
    }

    #[test]
    fn seek_back_write_seek_forward_read() {
        let (_dir, path, mut model) = scratch(300_000);
        let mut storage = BufferedStorage::open(&path, true).unwrap();

        storage.seek(SeekFrom::Start(1_000)).unwrap();
        storage.write_all(&[0xAA; 100]).unwrap();
        model[1_000..1_100].fill(0xAA);

        // Backward inside the same window: the pending bytes must survive.
        storage.seek(SeekFrom::Start(500)).unwrap();
        storage.write_all(&[0xBB; 10]).unwrap();
        model[500..510].fill(0xBB);

        storage.seek(SeekFrom::Start(200_000)).unwrap();
        let mut far = [0u8; 16];
        storage.read_exact(&mut far).unwrap();
        assert_eq!(&far[..], &model[200_000..200_016]);

        storage.seek(SeekFrom::Start(490)).unwrap();
        let mut near = vec![0u8; 700];
        storage.read_exact(&mut near).unwrap();
        assert_eq!(near, model[490..1_190]);

        storage.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), model);
    }

    #[test]
    fn sync_persists_pending_window_before_close() {
        let (_dir, path, mut model) = scratch(WINDOW_SIZE + 10);
        let mut storage = BufferedStorage::open(&path, true).unwrap();
        storage.seek(SeekFrom::Start(64)).unwrap();
        storage.write_all(&[0xCC; 32]).unwrap();
        model[64..96].fill(0xCC);

        storage.sync().unwrap();
        assert_eq!(fs::read(&path).unwrap(), model);
        storage.close().unwrap();
    }

    #[test]
    fn writes_spanning_window_boundaries_read_back_through_fresh_view() {
        let (_dir, path, mut model) = scratch(3 * WINDOW_SIZE + 123);
        let mut storage = BufferedStorage::open(&path, true).unwrap();

        let mut state = 99u64;
        for round in 0..64 {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let len = 1 + (state >> 40) as usize % 9_000;
            let max_start = model.len() - len;
            let start = if round % 4 == 0 {
                // Straddle a window edge on purpose.
                (((state >> 20) as usize % 2) + 1) * WINDOW_SIZE - len / 2
            } else {
                (state >> 24) as usize % max_start
            };
            let chunk = pattern(len, round);
            storage.seek(SeekFrom::Start(start as u64)).unwrap();
            storage.write_all(&chunk).unwrap();
            model[start..start + len].copy_from_slice(&chunk);
        }
        storage.close().unwrap();

        let mut fresh = BufferedStorage::open(&path, false).unwrap();
        let mut all = Vec::new();
        fresh.read_to_end(&mut all).unwrap();
        assert_eq!(all, model);
    }

    #[test]
    fn appending_past_end_extends_the_medium() {
        let (_dir, path, mut model) = scratch(WINDOW_SIZE - 4);
        let mut storage = BufferedStorage::open(&path, true).unwrap();
        storage.seek(SeekFrom::End(0)).unwrap();
        let tail = pattern(20, 3);
        storage.write_all(&tail).unwrap();
        model.extend_from_slice(&tail);
        assert_eq!(storage.length().unwrap(), model.len() as u64);

        storage.seek(SeekFrom::Start(0)).unwrap();
        let mut all = Vec::new();
        storage.read_to_end(&mut all).unwrap();
        assert_eq!(all, model);
        storage.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), model);
    }

    #[test]
    fn set_length_truncates_and_realigns() {
        let (_dir, path, model) = scratch(2 * WINDOW_SIZE);
        let mut storage = BufferedStorage::open(&path, true).unwrap();
        storage.seek(SeekFrom::Start(WINDOW_SIZE as u64 + 10)).unwrap();
        storage.write_all(b"dirty").unwrap();

        storage.set_length(1_000).unwrap();
        assert_eq!(storage.position(), 1_000);
        assert_eq!(storage.length().unwrap(), 1_000);

        storage.write_all(b"tail").unwrap();
        storage.close().unwrap();

        let written = fs::read(&path).unwrap();
        assert_eq!(written.len(), 1_004);
        assert_eq!(&written[..1_000], &model[..1_000]);
        assert_eq!(&written[1_000..], b"tail");
    }

    #[test]
    fn short_read_reports_unexpected_eof() {
        let (_dir, path, _) = scratch(10);
        let mut storage = BufferedStorage::open(&path, false).unwrap();
        storage.seek(SeekFrom::Start(8)).unwrap();
        let mut buf = [0u8; 4];
        let err = storage.read_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(storage.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn fragments_are_relative_and_read_only() {
        let (_dir, path, model) = scratch(50_000);
        let mut storage = BufferedStorage::open(&path, true).unwrap();
        let mut fragment = storage.new_fragment(40_000, 5_000).unwrap();
        assert_eq!(fragment.length().unwrap(), 5_000);
        assert!(fragment.name().ends_with("-Fragment(40000,5000)"));

        let mut bytes = Vec::new();
        fragment.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, model[40_000..45_000]);

        fragment.seek(SeekFrom::Start(0)).unwrap();
        fragment.write_all(b"nope").unwrap();
        let err = fragment.flush().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        assert!(storage.new_fragment(49_000, 5_000).is_err());
    }
}
