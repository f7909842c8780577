use crate::{pool::Pool, Error, MAX_STREAM_SIZE};
use std::{backtrace::Backtrace, fmt, io};
use tracing::debug;

/// A pooled, seekable in-memory byte stream.
///
/// A stream starts backed by a chain of fixed-size blocks checked out of its
/// [Pool]. Requesting a contiguous view of content spanning more than one
/// block ([Stream::get_buffer]) promotes the stream to a single large buffer;
/// promotion is one-way, and later growth replaces the large buffer with a
/// bigger one. All backing memory returns to the pool when the stream is
/// closed, or on drop.
///
/// Logical length and the cursor are independent: the position may be moved
/// past the end of the stream, and a write there zero-fills the gap.
///
/// # Thread Safety
///
/// A stream is owned by one thread at a time; only the [Pool] behind it is
/// safe for concurrent use.
///
/// # Example
///
/// ```
/// use prometheus_client::registry::Registry;
/// use slabstream::{Pool, PoolConfig};
/// use std::io::SeekFrom;
///
/// let mut registry = Registry::default();
/// let pool = Pool::new(PoolConfig::default(), &mut registry).unwrap();
///
/// let mut stream = pool.stream(None);
/// stream.write(b"abc").unwrap();
/// stream.seek(SeekFrom::Start(1)).unwrap();
/// assert_eq!(stream.read_byte().unwrap(), Some(b'b'));
/// stream.close().unwrap();
/// ```
pub struct Stream {
    /// Pool that owns this stream's backing memory.
    pool: Pool,
    /// Opaque 128-bit identifier.
    id: u128,
    /// Optional diagnostic label.
    tag: Option<String>,
    /// Creation call site, captured when the pool has call-site capture
    /// enabled.
    allocated_at: Option<Backtrace>,
    /// First close call site, captured when call-site capture is enabled.
    closed_at: Option<Backtrace>,
    /// Block chain. Non-empty whenever no large buffer is active; may also
    /// hold blocks retained after promotion in passive-release mode.
    blocks: Vec<Vec<u8>>,
    /// Active contiguous backing, once promoted.
    large: Option<Vec<u8>>,
    /// Superseded large buffers retained until close in passive-release mode.
    retired_large: Vec<Vec<u8>>,
    /// Logical length in bytes. At most [MAX_STREAM_SIZE].
    length: usize,
    /// Cursor. May exceed `length`; at most [MAX_STREAM_SIZE].
    position: usize,
    /// Whether the stream has released its buffers.
    closed: bool,
}

impl Stream {
    pub(crate) fn new(
        pool: Pool,
        id: u128,
        tag: Option<&str>,
        blocks: Vec<Vec<u8>>,
        large: Option<Vec<u8>>,
        capture: bool,
    ) -> Self {
        Self {
            pool,
            id,
            tag: tag.map(str::to_owned),
            allocated_at: capture.then(Backtrace::force_capture),
            closed_at: None,
            blocks,
            large,
            retired_large: Vec::new(),
            length: 0,
            position: 0,
            closed: false,
        }
    }

    /// Opaque identifier, unique among streams of the same pool.
    pub fn id(&self) -> u128 {
        self.id
    }

    /// Diagnostic label supplied at creation.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Whether the stream has been closed. A closed stream holds no buffers
    /// and rejects every mutating or I/O operation.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the stream contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current backing capacity in bytes: the active large buffer's length,
    /// or the block chain's total size.
    pub fn capacity(&self) -> usize {
        match &self.large {
            Some(large) => large.len(),
            None => self.blocks.len() * self.pool.block_size(),
        }
    }

    /// Current cursor. May exceed [Stream::len].
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Moves the cursor. Positions beyond the end are allowed and do not
    /// change the stream's length.
    ///
    /// # Errors
    ///
    /// - [Error::Closed] after close
    /// - [Error::OutOfRange] beyond [MAX_STREAM_SIZE]
    pub fn set_position(&mut self, position: u64) -> Result<(), Error> {
        self.ensure_open()?;
        if position > MAX_STREAM_SIZE as u64 {
            return Err(Error::OutOfRange);
        }
        self.position = position as usize;
        Ok(())
    }

    /// Requests that the backing capacity be at least `target` bytes.
    ///
    /// The granted capacity is rounded up to the backing granularity: whole
    /// blocks, or a multiple of the pool's large granularity once promoted.
    /// Values at or below the current capacity leave the stream unchanged.
    ///
    /// # Errors
    ///
    /// - [Error::Closed] after close
    /// - [Error::OutOfRange] beyond [MAX_STREAM_SIZE]
    /// - [Error::CapacityExceeded] beyond the pool's per-stream ceiling; the
    ///   stream is left unchanged
    pub fn set_capacity(&mut self, target: usize) -> Result<(), Error> {
        self.ensure_open()?;
        if target > MAX_STREAM_SIZE {
            return Err(Error::OutOfRange);
        }
        if target <= self.capacity() {
            return Ok(());
        }
        self.grow(target)
    }

    /// Sets the logical length.
    ///
    /// Growing zero-fills the new range; shrinking clamps the cursor down to
    /// the new end but releases no memory.
    ///
    /// # Errors
    ///
    /// Same as [Stream::set_capacity].
    pub fn set_len(&mut self, len: u64) -> Result<(), Error> {
        self.ensure_open()?;
        if len > MAX_STREAM_SIZE as u64 {
            return Err(Error::OutOfRange);
        }
        let len = len as usize;
        if len > self.capacity() {
            self.grow(len)?;
        }
        if len > self.length {
            self.zero_range(self.length, len);
        }
        self.length = len;
        if self.position > len {
            self.position = len;
        }
        Ok(())
    }

    /// Writes `buf` at the cursor, growing the stream as needed.
    ///
    /// Writing past the end zero-fills the gap between the old length and the
    /// cursor. On any error the stream is left unchanged.
    ///
    /// # Errors
    ///
    /// - [Error::Closed] after close
    /// - [Error::StreamOverflow] if the write would pass [MAX_STREAM_SIZE]
    /// - [Error::CapacityExceeded] if growth would pass the pool's
    ///   per-stream ceiling
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let end = match self.position.checked_add(buf.len()) {
            Some(end) if end <= MAX_STREAM_SIZE => end,
            _ => return Err(Error::StreamOverflow),
        };
        if end > self.capacity() {
            self.grow(end)?;
        }
        if self.position > self.length {
            self.zero_range(self.length, self.position);
        }
        self.copy_in(buf, self.position);
        self.position = end;
        if end > self.length {
            self.length = end;
        }
        Ok(())
    }

    /// Writes a single byte at the cursor.
    ///
    /// # Errors
    ///
    /// Same as [Stream::write].
    pub fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.write(&[byte])
    }

    /// Reads up to `buf.len()` bytes from the cursor, returning how many were
    /// copied. Returns 0 at or past the end; short reads are not errors.
    ///
    /// # Errors
    ///
    /// [Error::Closed] after close.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ensure_open()?;
        if self.position >= self.length {
            return Ok(0);
        }
        let count = buf.len().min(self.length - self.position);
        self.copy_out(self.position, &mut buf[..count]);
        self.position += count;
        Ok(count)
    }

    /// Reads the byte at the cursor, or `None` at the end.
    ///
    /// # Errors
    ///
    /// [Error::Closed] after close.
    pub fn read_byte(&mut self) -> Result<Option<u8>, Error> {
        self.ensure_open()?;
        if self.position >= self.length {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        self.copy_out(self.position, &mut byte);
        self.position += 1;
        Ok(Some(byte[0]))
    }

    /// Moves the cursor relative to the start, the current position, or the
    /// end, returning the new position. Seeking past the end is permitted and
    /// does not change the stream's length.
    ///
    /// # Errors
    ///
    /// - [Error::Closed] after close
    /// - [Error::SeekBeforeBegin] if the target is negative
    /// - [Error::OutOfRange] beyond [MAX_STREAM_SIZE]
    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64, Error> {
        self.ensure_open()?;
        let target = match pos {
            io::SeekFrom::Start(offset) => offset as i128,
            io::SeekFrom::Current(offset) => self.position as i128 + offset as i128,
            io::SeekFrom::End(offset) => self.length as i128 + offset as i128,
        };
        if target < 0 {
            return Err(Error::SeekBeforeBegin);
        }
        if target > MAX_STREAM_SIZE as i128 {
            return Err(Error::OutOfRange);
        }
        self.position = target as usize;
        Ok(self.position as u64)
    }

    /// Returns the stream's content as one contiguous slice.
    ///
    /// The first [Stream::len] bytes are the content; anything beyond is
    /// unspecified. The same backing allocation is returned on every call
    /// until the next capacity-changing operation, so the slice is stable
    /// across reads.
    ///
    /// Content spanning more than one block is first promoted into a single
    /// large buffer sized for at least the current length; a single block is
    /// returned as-is. Promotion is one-way: later growth replaces the large
    /// buffer, never re-chains blocks.
    ///
    /// # Errors
    ///
    /// [Error::Closed] after close.
    pub fn get_buffer(&mut self) -> Result<&[u8], Error> {
        self.ensure_open()?;
        if self.large.is_none() && self.blocks.len() > 1 {
            self.promote();
        }
        match &self.large {
            Some(large) => Ok(large.as_slice()),
            None => Ok(self.blocks[0].as_slice()),
        }
    }

    /// Copies the content into a fresh, unpooled `Vec` of exactly
    /// [Stream::len] bytes. Never shares identity with [Stream::get_buffer].
    ///
    /// # Errors
    ///
    /// [Error::Closed] after close.
    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        let mut out = vec![0u8; self.length];
        self.copy_out(0, &mut out);
        Ok(out)
    }

    /// Writes the content `[0..len)` to `writer` without moving the cursor.
    ///
    /// # Errors
    ///
    /// - [Error::Closed] after close
    /// - [Error::Io] if the writer fails
    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(large) = &self.large {
            writer.write_all(&large[..self.length])?;
            return Ok(());
        }
        let mut remaining = self.length;
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let count = remaining.min(block.len());
            writer.write_all(&block[..count])?;
            remaining -= count;
        }
        Ok(())
    }

    /// Returns every buffer held by this stream to the pool and marks the
    /// stream closed.
    ///
    /// # Errors
    ///
    /// [Error::Closed] on a repeated close. The repeat is otherwise a no-op,
    /// but it emits a double-close event carrying the captured call sites
    /// when the pool has call-site capture enabled.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            self.pool.record_double_close(
                self.id,
                self.tag.as_deref(),
                self.allocated_at.as_ref(),
                self.closed_at.as_ref(),
            );
            return Err(Error::Closed);
        }
        if self.pool.capture_call_sites() {
            self.closed_at = Some(Backtrace::force_capture());
        }
        self.release();
        self.closed = true;
        self.pool.record_stream_closed(self.id, self.tag.as_deref());
        Ok(())
    }

    /// Hands all held buffers back to the pool and clears local state.
    fn release(&mut self) {
        let blocks = std::mem::take(&mut self.blocks);
        self.pool.release_blocks(blocks, self.tag.as_deref());
        if let Some(large) = self.large.take() {
            self.pool.release_large(large, self.tag.as_deref());
        }
        for large in std::mem::take(&mut self.retired_large) {
            self.pool.release_large(large, self.tag.as_deref());
        }
        self.length = 0;
        self.position = 0;
    }

    /// Grows the backing so `capacity() >= target`.
    ///
    /// The pool's per-stream ceiling is enforced against the requested target
    /// before any state changes.
    fn grow(&mut self, target: usize) -> Result<(), Error> {
        let max = self.pool.max_stream_capacity();
        if max > 0 && target > max {
            return Err(Error::CapacityExceeded);
        }

        // Once promoted, growth stays contiguous: swap in a bigger large
        // buffer and retire the old one.
        if let Some(current) = self.large.as_ref().map(Vec::len) {
            if target <= current {
                return Ok(());
            }
            let mut next = self.pool.get_large_buffer(target, self.tag.as_deref());
            if let Some(previous) = self.large.take() {
                next[..self.length].copy_from_slice(&previous[..self.length]);
                self.retire_large(previous);
            }
            self.large = Some(next);
            return Ok(());
        }

        // Block-backed: extend the chain until it covers the target.
        let block_size = self.pool.block_size();
        while self.blocks.len() * block_size < target {
            self.blocks.push(self.pool.get_block());
        }
        Ok(())
    }

    /// Copies the block chain into a single large buffer and installs it as
    /// the active backing.
    fn promote(&mut self) {
        let block_size = self.pool.block_size();
        let requested = self.length.max(block_size + 1);
        let mut large = self.pool.get_large_buffer(requested, self.tag.as_deref());

        let mut copied = 0;
        for block in &self.blocks {
            if copied >= self.length {
                break;
            }
            let count = (self.length - copied).min(block.len());
            large[copied..copied + count].copy_from_slice(&block[..count]);
            copied += count;
        }
        debug!(
            blocks = self.blocks.len(),
            size = large.len(),
            "promoted stream to large buffer"
        );
        self.large = Some(large);

        if self.pool.aggressive_buffer_return() {
            let blocks = std::mem::take(&mut self.blocks);
            self.pool.release_blocks(blocks, self.tag.as_deref());
        }
        // Passive mode keeps the blocks until close.
    }

    /// Disposes of a superseded large buffer per the pool's release mode.
    fn retire_large(&mut self, buffer: Vec<u8>) {
        if self.pool.aggressive_buffer_return() {
            self.pool.release_large(buffer, self.tag.as_deref());
        } else {
            self.retired_large.push(buffer);
        }
    }

    /// Zero-fills `[from, to)` so recycled bytes never become readable.
    /// Capacity must already cover `to`.
    fn zero_range(&mut self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        if let Some(large) = &mut self.large {
            large[from..to].fill(0);
            return;
        }
        let block_size = self.pool.block_size();
        let mut offset = from;
        while offset < to {
            let block = offset / block_size;
            let within = offset % block_size;
            let count = (to - offset).min(block_size - within);
            self.blocks[block][within..within + count].fill(0);
            offset += count;
        }
    }

    /// Copies `buf` into the backing at `offset`. Capacity must already
    /// cover `offset + buf.len()`.
    fn copy_in(&mut self, buf: &[u8], offset: usize) {
        if let Some(large) = &mut self.large {
            large[offset..offset + buf.len()].copy_from_slice(buf);
            return;
        }
        let block_size = self.pool.block_size();
        let mut offset = offset;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let block = offset / block_size;
            let within = offset % block_size;
            let count = remaining.len().min(block_size - within);
            self.blocks[block][within..within + count].copy_from_slice(&remaining[..count]);
            offset += count;
            remaining = &remaining[count..];
        }
    }

    /// Copies `buf.len()` bytes of the backing starting at `offset` into
    /// `buf`. The range must be within the initialized length.
    fn copy_out(&self, offset: usize, buf: &mut [u8]) {
        if let Some(large) = &self.large {
            buf.copy_from_slice(&large[offset..offset + buf.len()]);
            return;
        }
        let block_size = self.pool.block_size();
        let mut offset = offset;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let block = offset / block_size;
            let within = offset % block_size;
            let count = remaining.len().min(block_size - within);
            remaining[..count].copy_from_slice(&self.blocks[block][within..within + count]);
            offset += count;
            remaining = &mut remaining[count..];
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Stream {
    /// Dropping an unclosed stream still returns its buffers, but flags the
    /// stream for leak diagnostics.
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.release();
        self.closed = true;
        self.pool
            .record_stream_leaked(self.id, self.tag.as_deref(), self.allocated_at.as_ref());
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stream(id={:032x}, tag={}, len={})",
            self.id,
            self.tag.as_deref().unwrap_or("-"),
            self.length
        )
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &format_args!("{:032x}", self.id))
            .field("tag", &self.tag)
            .field("length", &self.length)
            .field("position", &self.position)
            .field("capacity", &self.capacity())
            .field("closed", &self.closed)
            .finish()
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for Stream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        Stream::seek(self, pos).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, EventSink, PoolConfig};
    use parking_lot::Mutex;
    use prometheus_client::registry::Registry;
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    use std::io::SeekFrom;
    use std::sync::Arc;

    const BLOCK: usize = 16 * 1024;
    const MULTIPLE: usize = 1024 * 1024;
    const MAX_BUFFER: usize = 8 * 1024 * 1024;

    /// Pool with the default geometry (16 KiB / 1 MiB / 8 MiB).
    fn spec_pool() -> Pool {
        let mut registry = Registry::default();
        Pool::new(PoolConfig::default(), &mut registry).unwrap()
    }

    /// Pool with a tiny geometry for cheap edge-case tests: 16-byte blocks,
    /// 64-byte large granularity, 256-byte pooled ceiling.
    fn small_pool() -> Pool {
        let mut registry = Registry::default();
        let config = PoolConfig::default()
            .with_block_size(16)
            .with_large_buffer_multiple(64)
            .with_max_buffer_size(256);
        Pool::new(config, &mut registry).unwrap()
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_write_read_roundtrip() {
        let pool = spec_pool();
        let data = random_bytes(100);

        let mut stream = pool.stream(None);
        stream.write(&data).unwrap();
        assert_eq!(stream.len(), 100);
        assert_eq!(stream.position(), 100);

        stream.set_position(0).unwrap();
        let mut buf = vec![0u8; 100];
        assert_eq!(stream.read(&mut buf).unwrap(), 100);
        assert_eq!(buf, data);
        assert_eq!(stream.position(), 100);
        stream.close().unwrap();
    }

    #[test]
    fn test_read_is_bounded_by_length() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        stream.write(&[1, 2, 3]).unwrap();

        // A short read past the end returns what's left, then zero.
        stream.set_position(1).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[2, 3]);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        // Reading from beyond the end is not an error.
        stream.set_position(100).unwrap();
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        stream.close().unwrap();
    }

    #[test]
    fn test_read_and_write_bytes() {
        let pool = small_pool();
        let mut stream = pool.stream(None);

        // Crossing the block boundary grows by exactly one block.
        for byte in 0..16u8 {
            stream.write_byte(byte).unwrap();
        }
        assert_eq!(stream.capacity(), 16);
        stream.write_byte(16).unwrap();
        assert_eq!(stream.capacity(), 32);

        stream.set_position(0).unwrap();
        for byte in 0..17u8 {
            assert_eq!(stream.read_byte().unwrap(), Some(byte));
        }
        assert_eq!(stream.read_byte().unwrap(), None);
        stream.close().unwrap();
    }

    #[test]
    fn test_promotion_to_large_buffer() {
        let pool = spec_pool();
        let data = random_bytes(BLOCK + 1);

        let mut stream = pool.stream(None);
        stream.write(&data).unwrap();
        assert_eq!(stream.capacity(), 2 * BLOCK);

        let buffer = stream.get_buffer().unwrap();
        assert_eq!(buffer.len(), MULTIPLE);
        assert_eq!(&buffer[..data.len()], &data[..]);
        assert_eq!(stream.position(), (BLOCK + 1) as u64);
        assert_eq!(pool.large_pool_in_use_bytes(), MULTIPLE);
        stream.close().unwrap();
    }

    #[test]
    fn test_get_buffer_single_block_skips_promotion() {
        let pool = spec_pool();
        let mut stream = pool.stream(None);
        stream.write(&[5u8; 100]).unwrap();

        let buffer = stream.get_buffer().unwrap();
        assert_eq!(buffer.len(), BLOCK);
        assert_eq!(&buffer[..100], &[5u8; 100]);
        // No large buffer was involved.
        assert_eq!(pool.large_pool_in_use_bytes(), 0);
        stream.close().unwrap();
    }

    #[test]
    fn test_capacity_above_one_block_forces_promotion() {
        let pool = spec_pool();
        let mut stream = pool.stream(None);
        stream.write(&[1u8; 10]).unwrap();
        stream.set_capacity(BLOCK + 1).unwrap();

        let buffer = stream.get_buffer().unwrap();
        assert_eq!(buffer.len(), MULTIPLE);
        assert_eq!(&buffer[..10], &[1u8; 10]);
        stream.close().unwrap();
    }

    #[test]
    fn test_get_buffer_identity_is_stable() {
        let pool = spec_pool();
        let mut stream = pool.stream(None);
        stream.write(&random_bytes(BLOCK * 2)).unwrap();

        let first = stream.get_buffer().unwrap().as_ptr();
        let second = stream.get_buffer().unwrap().as_ptr();
        assert_eq!(first, second);

        // A capacity-increasing operation may move the backing.
        stream.set_capacity(2 * MULTIPLE).unwrap();
        let third = stream.get_buffer().unwrap().as_ptr();
        assert_ne!(first, third);
        stream.close().unwrap();
    }

    #[test]
    fn test_set_capacity_rounds_and_never_shrinks() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        assert_eq!(stream.capacity(), 16);

        stream.set_capacity(17).unwrap();
        assert_eq!(stream.capacity(), 32);

        // Smaller requests leave the capacity alone.
        stream.set_capacity(1).unwrap();
        assert_eq!(stream.capacity(), 32);
        stream.close().unwrap();
    }

    #[test]
    fn test_capacity_ceiling_preserves_state() {
        let pool = spec_pool();
        pool.set_max_stream_capacity(2 * MAX_BUFFER);

        let mut stream = pool.stream(None);
        stream.write(&[3u8; 10]).unwrap();
        let capacity = stream.capacity();

        let result = stream.set_capacity(2 * MAX_BUFFER + 1);
        assert!(matches!(result, Err(Error::CapacityExceeded)));
        assert_eq!(stream.capacity(), capacity);
        assert_eq!(stream.len(), 10);
        assert_eq!(stream.position(), 10);

        // The ceiling itself is reachable.
        stream.set_capacity(2 * MAX_BUFFER).unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn test_write_past_ceiling_preserves_state() {
        let pool = small_pool();
        pool.set_max_stream_capacity(32);

        let mut stream = pool.stream(None);
        stream.write(&[1u8; 10]).unwrap();

        let result = stream.write(&[2u8; 40]);
        assert!(matches!(result, Err(Error::CapacityExceeded)));
        assert_eq!(stream.len(), 10);
        assert_eq!(stream.position(), 10);
        assert_eq!(stream.capacity(), 16);

        // The stream remains usable within the ceiling.
        stream.write(&[2u8; 20]).unwrap();
        assert_eq!(stream.len(), 30);
        stream.close().unwrap();
    }

    #[test]
    fn test_stream_overflow_preserves_state() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        stream.write(&[9u8; 4]).unwrap();
        stream.set_position(MAX_STREAM_SIZE as u64 - 10).unwrap();

        let result = stream.write(&[0u8; 20]);
        assert!(matches!(result, Err(Error::StreamOverflow)));
        assert_eq!(stream.len(), 4);
        assert_eq!(stream.position(), MAX_STREAM_SIZE as u64 - 10);
        assert_eq!(stream.capacity(), 16);
        stream.close().unwrap();
    }

    #[test]
    fn test_set_len_grows_zeroed_and_clamps_position() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        stream.write(&[7u8; 8]).unwrap();

        stream.set_len(40).unwrap();
        assert_eq!(stream.len(), 40);
        assert!(stream.capacity() >= 40);
        let buffer = stream.get_buffer().unwrap();
        assert_eq!(&buffer[..8], &[7u8; 8]);
        assert!(buffer[8..40].iter().all(|&b| b == 0));

        // Shrinking clamps the cursor to the new end.
        stream.set_position(30).unwrap();
        stream.set_len(20).unwrap();
        assert_eq!(stream.len(), 20);
        assert_eq!(stream.position(), 20);
        stream.close().unwrap();
    }

    #[test]
    fn test_set_len_rejects_out_of_range() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        assert!(matches!(
            stream.set_len(MAX_STREAM_SIZE as u64 + 1),
            Err(Error::OutOfRange)
        ));
        assert!(matches!(
            stream.set_position(MAX_STREAM_SIZE as u64 + 1),
            Err(Error::OutOfRange)
        ));
        stream.close().unwrap();
    }

    #[test]
    fn test_seek() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        stream.write(&[1u8; 10]).unwrap();

        assert_eq!(stream.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(stream.seek(SeekFrom::Current(3)).unwrap(), 7);
        assert_eq!(stream.seek(SeekFrom::Current(-7)).unwrap(), 0);
        assert_eq!(stream.seek(SeekFrom::End(-10)).unwrap(), 0);
        assert_eq!(stream.seek(SeekFrom::End(5)).unwrap(), 15);
        assert_eq!(stream.len(), 10);

        assert!(matches!(
            stream.seek(SeekFrom::Current(-100)),
            Err(Error::SeekBeforeBegin)
        ));
        assert!(matches!(
            stream.seek(SeekFrom::Start(MAX_STREAM_SIZE as u64 + 1)),
            Err(Error::OutOfRange)
        ));
        stream.close().unwrap();
    }

    #[test]
    fn test_write_past_end_zero_fills_gap() {
        let pool = small_pool();

        // Dirty a block and return it so the next stream gets recycled bytes.
        let mut dirty = pool.stream(None);
        dirty.write(&[0xFFu8; 16]).unwrap();
        dirty.close().unwrap();

        let data = random_bytes(100);
        let mut stream = pool.stream(None);
        stream.seek(SeekFrom::Start(100)).unwrap();
        stream.write(&data).unwrap();
        assert_eq!(stream.len(), 200);
        assert_eq!(stream.position(), 200);

        let mut out = vec![0u8; 200];
        stream.set_position(0).unwrap();
        assert_eq!(stream.read(&mut out).unwrap(), 200);
        assert!(out[..100].iter().all(|&b| b == 0));
        assert_eq!(&out[100..], &data[..]);
        stream.close().unwrap();
    }

    #[test]
    fn test_passive_retention_returns_everything_at_close() {
        let pool = spec_pool();
        assert!(!pool.aggressive_buffer_return());

        // Seed with one multiple, then grow past it twice: three large
        // buffers are outstanding at once in passive mode.
        let mut stream = pool.stream_contiguous(None, BLOCK + 1).unwrap();
        assert_eq!(pool.large_pool_in_use_bytes(), MULTIPLE);

        stream.write(&vec![1u8; MULTIPLE + 1]).unwrap();
        assert_eq!(pool.large_pool_in_use_bytes(), MULTIPLE * (1 + 2));

        stream.write(&vec![2u8; MULTIPLE]).unwrap();
        assert_eq!(pool.large_pool_in_use_bytes(), MULTIPLE * (1 + 2 + 3));

        stream.close().unwrap();
        assert_eq!(pool.large_pool_in_use_bytes(), 0);
        assert_eq!(pool.large_pool_free_bytes(), MULTIPLE * 6);
    }

    #[test]
    fn test_aggressive_return_recycles_immediately() {
        let pool = spec_pool();
        pool.set_aggressive_buffer_return(true);

        let mut stream = pool.stream_contiguous(None, BLOCK + 1).unwrap();
        stream.write(&vec![1u8; MULTIPLE + 1]).unwrap();

        // The superseded 1 MiB buffer went straight back to the pool.
        assert_eq!(pool.large_pool_in_use_bytes(), 2 * MULTIPLE);
        assert_eq!(pool.large_pool_free_bytes(), MULTIPLE);

        // Promotion under aggressive mode also returns the blocks at once.
        let mut blocky = pool.stream(None);
        blocky.write(&vec![3u8; BLOCK + 1]).unwrap();
        let small_in_use = pool.small_pool_in_use_bytes();
        blocky.get_buffer().unwrap();
        assert_eq!(pool.small_pool_in_use_bytes(), small_in_use - 2 * BLOCK);

        stream.close().unwrap();
        blocky.close().unwrap();
    }

    #[test]
    fn test_to_vec_is_fresh_and_exact() {
        let pool = small_pool();
        let data = random_bytes(40);
        let mut stream = pool.stream(None);
        stream.write(&data).unwrap();

        let copy = stream.to_vec().unwrap();
        assert_eq!(copy, data);
        assert_eq!(copy.len(), 40);
        let buffer = stream.get_buffer().unwrap();
        assert_ne!(copy.as_ptr(), buffer.as_ptr());
        stream.close().unwrap();
    }

    #[test]
    fn test_write_to_leaves_position_alone() {
        let pool = small_pool();
        let data = random_bytes(50);
        let mut stream = pool.stream(None);
        stream.write(&data).unwrap();
        stream.set_position(7).unwrap();

        let mut sink = Vec::new();
        stream.write_to(&mut sink).unwrap();
        assert_eq!(sink, data);
        assert_eq!(stream.position(), 7);

        // Also valid after promotion.
        stream.get_buffer().unwrap();
        let mut sink = Vec::new();
        stream.write_to(&mut sink).unwrap();
        assert_eq!(sink, data);
        stream.close().unwrap();
    }

    #[test]
    fn test_close_rejects_further_operations() {
        let pool = small_pool();
        let mut stream = pool.stream(None);
        stream.write(&[1u8; 4]).unwrap();
        stream.close().unwrap();
        assert!(stream.is_closed());
        assert_eq!(stream.capacity(), 0);

        assert!(matches!(stream.write(&[1]), Err(Error::Closed)));
        assert!(matches!(stream.read(&mut [0u8; 1]), Err(Error::Closed)));
        assert!(matches!(stream.read_byte(), Err(Error::Closed)));
        assert!(matches!(stream.seek(SeekFrom::Start(0)), Err(Error::Closed)));
        assert!(matches!(stream.set_len(1), Err(Error::Closed)));
        assert!(matches!(stream.set_capacity(1), Err(Error::Closed)));
        assert!(matches!(stream.get_buffer(), Err(Error::Closed)));
        assert!(matches!(stream.to_vec(), Err(Error::Closed)));
        assert!(matches!(
            stream.write_to(&mut Vec::new()),
            Err(Error::Closed)
        ));
    }

    /// Records double-close and leak events along with whether call sites
    /// were attached.
    #[derive(Default)]
    struct DiagnosticSink {
        double_closes: Mutex<Vec<bool>>,
        leaks: Mutex<Vec<bool>>,
    }

    impl EventSink for DiagnosticSink {
        fn emit(&self, event: Event<'_>) {
            match event {
                Event::DoubleClose { allocated_at, .. } => {
                    self.double_closes.lock().push(allocated_at.is_some());
                }
                Event::StreamLeaked { allocated_at, .. } => {
                    self.leaks.lock().push(allocated_at.is_some());
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_double_close_emits_event() {
        let mut registry = Registry::default();
        let sink = Arc::new(DiagnosticSink::default());
        let config = PoolConfig::default()
            .with_block_size(16)
            .with_large_buffer_multiple(64)
            .with_max_buffer_size(256);
        let pool = Pool::with_sink(config, &mut registry, sink.clone()).unwrap();

        let mut stream = pool.stream(None);
        stream.close().unwrap();
        assert!(matches!(stream.close(), Err(Error::Closed)));
        assert_eq!(sink.double_closes.lock().as_slice(), &[false]);

        // Buffers were only returned once.
        assert_eq!(pool.small_pool_in_use_bytes(), 0);
        assert_eq!(pool.small_blocks_free(), 1);
    }

    #[test]
    fn test_call_site_capture() {
        let mut registry = Registry::default();
        let sink = Arc::new(DiagnosticSink::default());
        let config = PoolConfig::default()
            .with_block_size(16)
            .with_large_buffer_multiple(64)
            .with_max_buffer_size(256)
            .with_capture_call_sites(true);
        let pool = Pool::with_sink(config, &mut registry, sink.clone()).unwrap();

        let mut stream = pool.stream(None);
        stream.close().unwrap();
        let _ = stream.close();
        assert_eq!(sink.double_closes.lock().as_slice(), &[true]);

        let leaked = pool.stream(None);
        drop(leaked);
        assert_eq!(sink.leaks.lock().as_slice(), &[true]);
    }

    #[test]
    fn test_drop_without_close_returns_buffers() {
        let pool = small_pool();
        {
            let mut stream = pool.stream(None);
            stream.write(&vec![1u8; 100]).unwrap();
            stream.get_buffer().unwrap();
        }
        assert_eq!(pool.small_pool_in_use_bytes(), 0);
        assert_eq!(pool.large_pool_in_use_bytes(), 0);
        assert_eq!(pool.outstanding_streams(), 0);
    }

    #[test]
    fn test_io_trait_impls() {
        use std::io::{Read, Seek, Write};

        fn exercise<S: Read + Write + Seek>(stream: &mut S) {
            assert_eq!(stream.write(b"hello world").unwrap(), 11);
            stream.seek(SeekFrom::Start(6)).unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"world");
            stream.flush().unwrap();
        }

        let pool = small_pool();
        let mut stream = pool.stream(None);
        exercise(&mut stream);

        // Seeking before the beginning surfaces as an I/O error.
        let err = io::Seek::seek(&mut stream, SeekFrom::Current(-100)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        stream.close().unwrap();
    }

    #[test]
    fn test_display_and_debug() {
        let pool = small_pool();
        let mut stream = pool.stream(Some("ingest"));
        stream.write(&[0u8; 12]).unwrap();

        let shown = format!("{stream}");
        assert!(shown.contains("tag=ingest"));
        assert!(shown.contains("len=12"));
        assert!(shown.contains(&format!("{:032x}", stream.id())));

        let debugged = format!("{stream:?}");
        assert!(debugged.contains("position: 12"));
        stream.close().unwrap();
    }

    #[test]
    fn test_large_stream_roundtrip_across_many_blocks() {
        let pool = small_pool();
        let data = random_bytes(1000);

        let mut stream = pool.stream(None);
        stream.write(&data).unwrap();
        assert_eq!(stream.capacity(), 63 * 16);

        stream.set_position(0).unwrap();
        let mut out = vec![0u8; 1000];
        assert_eq!(stream.read(&mut out).unwrap(), 1000);
        assert_eq!(out, data);

        // Overwrite a slice spanning block boundaries.
        stream.set_position(30).unwrap();
        stream.write(&[0xAA; 40]).unwrap();
        stream.set_position(0).unwrap();
        let mut out = vec![0u8; 1000];
        stream.read(&mut out).unwrap();
        assert_eq!(&out[..30], &data[..30]);
        assert_eq!(&out[30..70], &[0xAA; 40]);
        assert_eq!(&out[70..], &data[70..]);
        stream.close().unwrap();
    }

    #[test]
    fn test_growth_after_promotion_stays_contiguous() {
        let pool = small_pool();
        let data = random_bytes(100);

        let mut stream = pool.stream(None);
        stream.write(&data).unwrap();
        let promoted_len = stream.get_buffer().unwrap().len();
        assert_eq!(promoted_len, 128);

        // Growth past the large buffer swaps in a bigger one and preserves
        // the content.
        stream.set_capacity(200).unwrap();
        let buffer = stream.get_buffer().unwrap();
        assert_eq!(buffer.len(), 256);
        assert_eq!(&buffer[..100], &data[..]);

        // The blocks retained passively plus both large buffers all come
        // back at close.
        stream.close().unwrap();
        assert_eq!(pool.small_pool_in_use_bytes(), 0);
        assert_eq!(pool.large_pool_in_use_bytes(), 0);
        assert_eq!(pool.large_pool_free_bytes(), 128 + 256);
    }
}
