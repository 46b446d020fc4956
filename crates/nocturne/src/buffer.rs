// src/buffer.rs
//! Pooled byte blocks and the chains that carry one direction of a stream.
//!
//! A [`BufferChain`] is an ordered list of [`Buffer`]s. Every block records the
//! stream position of its first byte (`absolute`), so positions grow without
//! bound and never reset even after leading blocks are released. Memory
//! blocks come from a [`Pool`]; file blocks reference an open file and are
//! transmitted with `sendfile`.

use crate::pool::Pool;
use crate::status::Status;
use crate::syscalls;
use bitflags::bitflags;
use libc::c_int;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs::{File, Metadata};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u8 {
        /// Last block of the stream.
        const EOS = 1 << 0;
        /// File-backed block; never holds bytes in memory.
        const OUT_FILE = 1 << 1;
    }
}

enum Storage {
    Memory { block: Box<[u8]>, pool: Pool },
    File { file: File, metadata: Metadata },
}

/// One block of a stream.
///
/// For memory blocks `base` is zero and `size`/`offset` index the block.
/// For file blocks `base` is the first file offset of the range, `offset` is
/// the next file offset to send and `size` is the file offset one past the
/// range.
pub struct Buffer {
    storage: Storage,
    capacity: usize,
    size: usize,
    offset: usize,
    base: usize,
    absolute: usize,
    flags: BufferFlags,
}

impl Buffer {
    /// Memory block taken from `pool`, ready for writing.
    pub fn new(pool: &Pool, absolute: usize) -> Buffer {
        let block = pool.acquire();
        Buffer {
            capacity: block.len(),
            storage: Storage::Memory {
                block,
                pool: pool.clone(),
            },
            size: 0,
            offset: 0,
            base: 0,
            absolute,
            flags: BufferFlags::empty(),
        }
    }

    /// File block covering `range_len` bytes of `path` from `range_start`,
    /// clamped to the file size.
    pub fn from_file(
        path: &Path,
        range_start: usize,
        range_len: usize,
        absolute: usize,
    ) -> io::Result<Buffer> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }

        let file_size = metadata.len() as usize;
        let start = range_start.min(file_size);
        let len = range_len.min(file_size - start);
        Ok(Buffer {
            storage: Storage::File { file, metadata },
            capacity: len,
            size: start + len,
            offset: start,
            base: start,
            absolute,
            flags: BufferFlags::OUT_FILE,
        })
    }

    pub fn is_out_file(&self) -> bool {
        self.flags.contains(BufferFlags::OUT_FILE)
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stream position of this block's first byte.
    pub fn absolute(&self) -> usize {
        self.absolute
    }

    /// Stream bytes held by the block, consumed or not.
    pub fn len(&self) -> usize {
        self.size - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumed(&self) -> usize {
        self.offset - self.base
    }

    pub fn available_for_read(&self) -> usize {
        self.size - self.offset
    }

    pub fn available_for_write(&self) -> usize {
        match self.storage {
            Storage::Memory { .. } => self.capacity - self.size,
            Storage::File { .. } => 0,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.offset >= self.size
    }

    /// Unread bytes of a memory block, `None` for file blocks.
    pub fn read_source(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Memory { block, .. } => Some(&block[self.offset..self.size]),
            Storage::File { .. } => None,
        }
    }

    /// Writable tail of a memory block, `None` for file blocks.
    pub fn write_target(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            Storage::Memory { block, .. } => Some(&mut block[self.size..self.capacity]),
            Storage::File { .. } => None,
        }
    }

    /// Open file and its metadata for file blocks.
    pub fn file(&self) -> Option<(&File, &Metadata)> {
        match &self.storage {
            Storage::File { file, metadata } => Some((file, metadata)),
            Storage::Memory { .. } => None,
        }
    }

    /// Next file offset to transmit. Meaningful for file blocks only.
    pub fn file_offset(&self) -> usize {
        self.offset
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Some(target) = self.write_target() else {
            return 0;
        };
        let n = target.len().min(bytes.len());
        target[..n].copy_from_slice(&bytes[..n]);
        self.size += n;
        n
    }

    /// Bytes in `[start, start + len)` of the stream held in memory by this
    /// block, consumed or not.
    fn memory_range(&self, start: usize, len: usize) -> Option<&[u8]> {
        let Storage::Memory { block, .. } = &self.storage else {
            return None;
        };
        let from = start.checked_sub(self.absolute)?;
        let to = from + len;
        if to > self.size {
            return None;
        }
        Some(&block[from..to])
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Storage::Memory { block, pool } = &mut self.storage {
            pool.release(std::mem::take(block));
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("absolute", &self.absolute)
            .field("flags", &self.flags)
            .finish()
    }
}

/// What a [`BufferChain::read`] callback did with the bytes it was offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    /// Consumed this many bytes; keep iterating. Zero means no progress is
    /// possible right now and ends the read with `Declined`.
    Continue(usize),
    /// Consumed this many bytes and finished.
    Done(usize),
    /// Stop without consuming, reporting the given status.
    Stop(Status),
}

/// Result of draining a descriptor into a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdRead {
    pub bytes: usize,
    pub eof: bool,
}

/// Ordered sequence of blocks forming one direction of a byte stream.
#[derive(Debug, Default)]
pub struct BufferChain {
    blocks: VecDeque<Buffer>,
    eos: bool,
    stream_end: usize,
    read_pos: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn front(&self) -> Option<&Buffer> {
        self.blocks.front()
    }

    pub fn back(&self) -> Option<&Buffer> {
        self.blocks.back()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// End of stream has been reached by the reader.
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// End of stream has been written; further writes are refused.
    pub fn is_closed(&self) -> bool {
        self.eos || self.blocks.back().is_some_and(Buffer::is_eos)
    }

    /// Stream position of the read cursor.
    pub fn bytes_read(&self) -> usize {
        self.read_pos
    }

    /// Stream position one past the last written byte.
    pub fn bytes_written(&self) -> usize {
        self.stream_end
    }

    /// Buffered bytes not yet read.
    pub fn size(&self) -> usize {
        self.stream_end - self.read_pos
    }

    /// Append `bytes`, filling the tail block before taking new ones from
    /// `pool`.
    ///
    /// A write with no bytes and a flag marks the current tail with it; with
    /// no tail an `EOS` flag ends the chain directly. Returns `false` when the
    /// stream has already been closed.
    pub fn write(&mut self, pool: &Pool, bytes: &[u8], flags: BufferFlags) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            if self.blocks.back().is_none_or(|b| b.available_for_write() == 0) {
                self.blocks.push_back(Buffer::new(pool, self.stream_end));
            }
            let Some(tail) = self.blocks.back_mut() else {
                break;
            };
            let n = tail.write(rest);
            rest = &rest[n..];
            self.stream_end += n;
        }

        let flags = flags & BufferFlags::EOS;
        if !flags.is_empty() {
            match self.blocks.back_mut() {
                Some(tail) => tail.flags |= flags,
                None => self.eos = true,
            }
        }
        true
    }

    /// Append a prepared block, typically a file block. Returns `false` when
    /// the stream has already been closed.
    pub fn append(&mut self, mut buffer: Buffer) -> bool {
        if self.is_closed() {
            return false;
        }
        buffer.absolute = self.stream_end;
        self.stream_end += buffer.len();
        self.read_pos += buffer.consumed();
        self.blocks.push_back(buffer);
        true
    }

    /// Move every block of `other` to the end of this chain, carrying its
    /// end-of-stream mark.
    pub fn append_chain(&mut self, other: &mut BufferChain) -> bool {
        if self.is_closed() {
            return false;
        }
        for block in other.blocks.drain(..) {
            self.append(block);
        }
        if other.eos {
            self.write_eos();
        }
        other.read_pos = other.stream_end;
        true
    }

    fn write_eos(&mut self) {
        match self.blocks.back_mut() {
            Some(tail) => tail.flags |= BufferFlags::EOS,
            None => self.eos = true,
        }
    }

    /// Drop fully consumed blocks from the front.
    pub fn release_empty(&mut self) {
        while let Some(front) = self.blocks.front() {
            if !front.is_drained() {
                break;
            }
            if front.is_eos() {
                self.eos = true;
            }
            self.blocks.pop_front();
        }
    }

    /// Discard every buffered byte.
    pub fn clear(&mut self) {
        if self.blocks.iter().any(Buffer::is_eos) {
            self.eos = true;
        }
        self.blocks.clear();
        self.read_pos = self.stream_end;
    }

    /// Offer unread bytes to `cb` block by block, front to back.
    ///
    /// Returns `Done` when the callback finishes or an end-of-stream block is
    /// drained, `Ok` when every buffered byte was consumed, and the
    /// callback's status when it stops early. With `release` set, drained
    /// blocks are dropped as soon as they are passed.
    pub fn read<F>(&mut self, release: bool, mut cb: F) -> Status
    where
        F: FnMut(&Buffer, &[u8]) -> Consume,
    {
        let mut idx = 0;
        let status = loop {
            let Some(block) = self.blocks.get_mut(idx) else {
                break if self.eos { Status::Done } else { Status::Ok };
            };

            let mut outcome = None;
            while block.available_for_read() > 0 {
                let available = block.available_for_read();
                let res = cb(&*block, block.read_source().unwrap_or(&[]));
                match res {
                    Consume::Continue(n) | Consume::Done(n) => {
                        let n = n.min(available);
                        block.offset += n;
                        self.read_pos += n;
                        if let Consume::Done(_) = res {
                            outcome = Some(Status::Done);
                            break;
                        }
                        if n == 0 {
                            outcome = Some(Status::Declined);
                            break;
                        }
                    }
                    Consume::Stop(status) => {
                        outcome = Some(status);
                        break;
                    }
                }
            }

            if block.is_drained() && block.is_eos() {
                self.eos = true;
                break Status::Done;
            }
            if let Some(status) = outcome {
                break status;
            }

            if release {
                self.blocks.pop_front();
            } else {
                idx += 1;
            }
        };

        if release {
            self.release_empty();
        }
        status
    }

    /// Drain everything readable from `fd` into the chain.
    ///
    /// Sizing comes from `FIONREAD`; reads continue until `EAGAIN` or end of
    /// file. Any other error is returned to the caller.
    pub fn read_from_fd(&mut self, pool: &Pool, fd: c_int) -> io::Result<FdRead> {
        let mut result = FdRead::default();
        loop {
            let pending = syscalls::bytes_available(fd).unwrap_or(0);

            if self.blocks.back().is_none_or(|b| b.available_for_write() == 0) {
                self.blocks.push_back(Buffer::new(pool, self.stream_end));
            }
            let Some(tail) = self.blocks.back_mut() else {
                return Ok(result);
            };
            let Some(target) = tail.write_target() else {
                return Ok(result);
            };
            let want = if pending == 0 {
                target.len()
            } else {
                pending.min(target.len())
            };

            match syscalls::read_nonblocking(fd, &mut target[..want]) {
                Ok(0) => {
                    result.eof = true;
                    return Ok(result);
                }
                Ok(n) => {
                    tail.size += n;
                    self.stream_end += n;
                    result.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(result),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Transmit buffered bytes to `fd`, releasing sent blocks.
    ///
    /// File blocks go through `sendfile`, memory blocks through `send`.
    /// `EAGAIN` yields `Declined`, any other error `Suspended`. `Done` means
    /// the end-of-stream block has been sent.
    pub fn write_to_fd(&mut self, fd: c_int, bytes_written: &mut usize) -> Status {
        self.read(true, |block, source| {
            let res = loop {
                let res = match block.file() {
                    Some((file, _)) => {
                        let mut off = block.file_offset() as i64;
                        syscalls::sendfile(fd, file.as_raw_fd(), &mut off, block.available_for_read())
                    }
                    None => syscalls::send_nonblocking(fd, source),
                };
                match res {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };

            match res {
                Ok(0) => Consume::Stop(Status::Suspended),
                Ok(n) => {
                    *bytes_written += n;
                    Consume::Continue(n)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Consume::Stop(Status::Declined),
                Err(_) => Consume::Stop(Status::Suspended),
            }
        })
    }

    /// Contiguous copy of stream bytes `[start, start + len)`.
    ///
    /// Consumed bytes can be extracted while their blocks are still in the
    /// chain. Returns `None` if any part of the range is not buffered in
    /// memory.
    pub fn extract(&self, start: usize, len: usize) -> Option<Vec<u8>> {
        if start + len > self.stream_end {
            return None;
        }
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        let end = start + len;
        for block in &self.blocks {
            if pos >= end {
                break;
            }
            let block_end = block.absolute + block.len();
            if block_end <= pos {
                continue;
            }
            if block.absolute > pos {
                return None;
            }
            let take = block_end.min(end) - pos;
            out.extend_from_slice(block.memory_range(pos, take)?);
            pos += take;
        }
        (pos == end).then_some(out)
    }

    /// Borrowed view of `[start, start + len)` when one block holds it,
    /// otherwise an extracted copy.
    pub fn slice(&self, start: usize, len: usize) -> Option<Cow<'_, [u8]>> {
        for block in &self.blocks {
            if block.absolute <= start && start + len <= block.absolute + block.len() {
                if let Some(bytes) = block.memory_range(start, len) {
                    return Some(Cow::Borrowed(bytes));
                }
            }
        }
        self.extract(start, len).map(Cow::Owned)
    }
}
