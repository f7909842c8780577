//! Two-tier buffer pool backing [Stream]s.
//!
//! The small pool is an unordered free list of fixed-size blocks. The large
//! pool is an array of free lists, one per size class: every large buffer's
//! length is a multiple of the pool's large granularity, up to the pooled
//! ceiling. Requests beyond the ceiling are satisfied with oversize buffers
//! that are handed out rounded to the granularity but never retained.
//!
//! # Thread Safety
//!
//! [Pool] is a cheaply cloneable handle over shared state and can be used
//! concurrently from any number of threads. Each tier's free list is guarded
//! by its own mutex; the byte counters are updated while the corresponding
//! lock is held, so after any single operation completes they are consistent
//! with free-list membership.
//!
//! # Ownership
//!
//! A checked-out buffer is exclusively owned by its holder. Returning one
//! moves it back into the pool, so a caller cannot retain a reference to a
//! buffer it has returned.

use crate::{
    config::PoolConfig,
    events::{Event, EventSink, NoopSink},
    metrics::Metrics,
    stream::Stream,
    Error, MAX_STREAM_SIZE,
};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use std::{
    backtrace::Backtrace,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, trace, warn};

/// Decrements `counter` by `value`, clamping at zero, and returns the
/// post-decrement value.
///
/// Clamping covers returns of buffers the pool never issued (tolerated, see
/// [Pool::return_large_buffer]).
fn saturating_sub(counter: &AtomicUsize, value: usize) -> usize {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(value);
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

/// A pool of recycled byte buffers and the factory for [Stream]s.
///
/// Cloning is cheap and shares the same underlying pool. See the
/// [module docs](self) for the pooling model.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.inner.block_size)
            .field("large_buffer_multiple", &self.inner.large_buffer_multiple)
            .field("max_buffer_size", &self.inner.max_buffer_size)
            .finish()
    }
}

struct Inner {
    /// Size of each pooled block, in bytes.
    block_size: usize,
    /// Granularity of large buffers, in bytes.
    large_buffer_multiple: usize,
    /// Largest pooled large-buffer length, in bytes.
    max_buffer_size: usize,

    /// Free blocks.
    small: Mutex<Vec<Vec<u8>>>,
    /// Free large buffers, one list per size class.
    large: Mutex<Vec<Vec<Vec<u8>>>>,

    /// Bytes checked out of the small pool.
    small_in_use: AtomicUsize,
    /// Bytes held in the small free pool.
    small_free: AtomicUsize,
    /// Bytes checked out of the large pool.
    large_in_use: AtomicUsize,
    /// Bytes held across all large free lists.
    large_free: AtomicUsize,

    /// Cap on free-block bytes retained. Zero means unbounded.
    max_free_small_bytes: AtomicUsize,
    /// Cap on free large-buffer bytes retained. Zero means unbounded.
    max_free_large_bytes: AtomicUsize,
    /// Per-stream capacity ceiling. Zero means unbounded.
    max_stream_capacity: AtomicUsize,
    /// Whether superseded stream buffers return immediately instead of at
    /// stream close.
    aggressive_buffer_return: AtomicBool,
    /// Whether streams capture allocation and close call sites.
    capture_call_sites: AtomicBool,

    /// Streams created and not yet closed or dropped.
    outstanding_streams: AtomicUsize,
    /// High 64 bits of every stream id issued by this pool.
    id_salt: u64,
    /// Low 64 bits of the next stream id.
    next_stream_id: AtomicU64,

    metrics: Metrics,
    sink: Arc<dyn EventSink>,
}

impl Pool {
    /// Creates a pool with the default event sink, which discards events.
    ///
    /// # Errors
    ///
    /// [Error::InvalidConfiguration] if the configuration is inconsistent
    /// (see [PoolConfig::validate]).
    pub fn new(config: PoolConfig, registry: &mut Registry) -> Result<Self, Error> {
        Self::with_sink(config, registry, Arc::new(NoopSink))
    }

    /// Creates a pool that notifies `sink` on allocation and return edges.
    ///
    /// # Errors
    ///
    /// [Error::InvalidConfiguration] if the configuration is inconsistent.
    pub fn with_sink(
        config: PoolConfig,
        registry: &mut Registry,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let metrics = Metrics::new(registry);
        let large = (0..config.num_classes()).map(|_| Vec::new()).collect();
        Ok(Self {
            inner: Arc::new(Inner {
                block_size: config.block_size,
                large_buffer_multiple: config.large_buffer_multiple,
                max_buffer_size: config.max_buffer_size,
                small: Mutex::new(Vec::new()),
                large: Mutex::new(large),
                small_in_use: AtomicUsize::new(0),
                small_free: AtomicUsize::new(0),
                large_in_use: AtomicUsize::new(0),
                large_free: AtomicUsize::new(0),
                max_free_small_bytes: AtomicUsize::new(config.max_free_small_bytes),
                max_free_large_bytes: AtomicUsize::new(config.max_free_large_bytes),
                max_stream_capacity: AtomicUsize::new(config.max_stream_capacity),
                aggressive_buffer_return: AtomicBool::new(config.aggressive_buffer_return),
                capture_call_sites: AtomicBool::new(config.capture_call_sites),
                outstanding_streams: AtomicUsize::new(0),
                id_salt: rand::random(),
                next_stream_id: AtomicU64::new(0),
                metrics,
                sink,
            }),
        })
    }

    /// Size of each pooled block, in bytes.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Granularity of large buffers, in bytes.
    pub fn large_buffer_multiple(&self) -> usize {
        self.inner.large_buffer_multiple
    }

    /// Largest large-buffer length the pool will retain, in bytes.
    pub fn max_buffer_size(&self) -> usize {
        self.inner.max_buffer_size
    }

    // ---- small pool ----

    /// Checks a block out of the small pool, allocating a fresh one if the
    /// free list is empty. Never fails.
    pub fn get_block(&self) -> Vec<u8> {
        let inner = &self.inner;
        let block_size = inner.block_size;
        let reused = {
            let mut small = inner.small.lock();
            let block = small.pop();
            if block.is_some() {
                let free = saturating_sub(&inner.small_free, block_size);
                inner.metrics.small_free_bytes.set(free as i64);
            }
            let in_use = inner.small_in_use.fetch_add(block_size, Ordering::Relaxed) + block_size;
            inner.metrics.small_in_use_bytes.set(in_use as i64);
            block
        };
        match reused {
            Some(block) => {
                trace!(size = block_size, "reused block");
                block
            }
            None => {
                trace!(size = block_size, "allocated block");
                inner.metrics.blocks_created.inc();
                inner.sink.emit(Event::BlockCreated { size: block_size });
                vec![0u8; block_size]
            }
        }
    }

    /// Returns blocks to the small pool.
    ///
    /// Every block is validated before any state changes: on error, nothing
    /// is accepted and the counters are untouched. Accepted blocks are pushed
    /// onto the free list until the free-byte cap is reached; the rest are
    /// dropped.
    ///
    /// # Errors
    ///
    /// [Error::WrongSizedBuffer] if any block's length differs from
    /// [Pool::block_size].
    pub fn return_blocks(&self, blocks: Vec<Vec<u8>>, tag: Option<&str>) -> Result<(), Error> {
        for block in &blocks {
            if block.len() != self.inner.block_size {
                return Err(Error::WrongSizedBuffer(block.len()));
            }
        }
        self.release_blocks(blocks, tag);
        Ok(())
    }

    /// Accepts pre-validated blocks back into the small pool.
    pub(crate) fn release_blocks(&self, blocks: Vec<Vec<u8>>, tag: Option<&str>) {
        if blocks.is_empty() {
            return;
        }
        let inner = &self.inner;
        let block_size = inner.block_size;
        let count = blocks.len();
        let mut discarded = Vec::new();
        {
            let mut small = inner.small.lock();
            let in_use = saturating_sub(&inner.small_in_use, count * block_size);
            inner.metrics.small_in_use_bytes.set(in_use as i64);
            let cap = inner.max_free_small_bytes.load(Ordering::Relaxed);
            for block in blocks {
                let free = inner.small_free.load(Ordering::Relaxed);
                if cap == 0 || free + block_size <= cap {
                    small.push(block);
                    inner.small_free.store(free + block_size, Ordering::Relaxed);
                    inner.metrics.small_free_bytes.set((free + block_size) as i64);
                } else {
                    discarded.push(block);
                }
            }
        }
        let accepted = count - discarded.len();
        if accepted > 0 {
            trace!(count = accepted, "returned blocks");
            inner.sink.emit(Event::BlockReturned {
                count: accepted,
                tag,
            });
        }
        if !discarded.is_empty() {
            debug!(count = discarded.len(), "small free pool at capacity, discarding blocks");
            inner.metrics.blocks_discarded.inc_by(discarded.len() as u64);
            for block in discarded {
                drop(block);
                inner.sink.emit(Event::BlockDiscarded {
                    size: block_size,
                    tag,
                });
            }
        }
    }

    // ---- large pool ----

    /// Checks out a large buffer of at least `min_size` bytes.
    ///
    /// The returned length is the smallest multiple of
    /// [Pool::large_buffer_multiple] that covers `min_size` (a zero request
    /// still yields one multiple). Requests whose rounded length exceeds
    /// [Pool::max_buffer_size] are satisfied with a freshly allocated
    /// oversize buffer that will never be pooled. Never fails.
    pub fn get_large_buffer(&self, min_size: usize, tag: Option<&str>) -> Vec<u8> {
        let inner = &self.inner;
        let requested = min_size.max(1).div_ceil(inner.large_buffer_multiple)
            * inner.large_buffer_multiple;

        let Some(class) = self.class_index(requested) else {
            // Oversize: allocated at the rounded size, never pooled.
            let in_use = inner.large_in_use.fetch_add(requested, Ordering::Relaxed) + requested;
            inner.metrics.large_in_use_bytes.set(in_use as i64);
            inner.metrics.large_oversize.inc();
            debug!(size = requested, "allocated oversize large buffer");
            inner.sink.emit(Event::LargeBufferCreated {
                requested: min_size,
                actual: requested,
                pooled: false,
                tag,
            });
            return vec![0u8; requested];
        };

        let reused = {
            let mut large = inner.large.lock();
            let buffer = large[class].pop();
            if buffer.is_some() {
                let free = saturating_sub(&inner.large_free, requested);
                inner.metrics.large_free_bytes.set(free as i64);
            }
            let in_use = inner.large_in_use.fetch_add(requested, Ordering::Relaxed) + requested;
            inner.metrics.large_in_use_bytes.set(in_use as i64);
            buffer
        };
        match reused {
            Some(buffer) => {
                trace!(size = requested, "reused large buffer");
                buffer
            }
            None => {
                debug!(size = requested, "allocated large buffer");
                inner.metrics.large_created.inc();
                inner.sink.emit(Event::LargeBufferCreated {
                    requested: min_size,
                    actual: requested,
                    pooled: true,
                    tag,
                });
                vec![0u8; requested]
            }
        }
    }

    /// Returns a large buffer to its size-class free list.
    ///
    /// Oversize buffers are dropped. In-range buffers are retained until the
    /// free-byte cap is reached, then dropped. Buffers this pool never issued
    /// are accepted as long as their length is a valid multiple; keeping the
    /// accounting honest in that case is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// [Error::WrongSizedBuffer] if the buffer is empty or its length is not
    /// a multiple of [Pool::large_buffer_multiple].
    pub fn return_large_buffer(&self, buffer: Vec<u8>, tag: Option<&str>) -> Result<(), Error> {
        let len = buffer.len();
        if len == 0 || len % self.inner.large_buffer_multiple != 0 {
            return Err(Error::WrongSizedBuffer(len));
        }
        self.release_large(buffer, tag);
        Ok(())
    }

    /// Accepts a pre-validated large buffer back into the large pool.
    pub(crate) fn release_large(&self, buffer: Vec<u8>, tag: Option<&str>) {
        let inner = &self.inner;
        let len = buffer.len();
        let in_use = saturating_sub(&inner.large_in_use, len);
        inner.metrics.large_in_use_bytes.set(in_use as i64);

        let Some(class) = self.class_index(len) else {
            drop(buffer);
            debug!(size = len, "discarding oversize large buffer");
            inner.metrics.large_discarded.inc();
            inner.sink.emit(Event::LargeBufferDiscarded { size: len, tag });
            return;
        };

        let rejected = {
            let mut large = inner.large.lock();
            let cap = inner.max_free_large_bytes.load(Ordering::Relaxed);
            let free = inner.large_free.load(Ordering::Relaxed);
            if cap == 0 || free + len <= cap {
                large[class].push(buffer);
                inner.large_free.store(free + len, Ordering::Relaxed);
                inner.metrics.large_free_bytes.set((free + len) as i64);
                None
            } else {
                Some(buffer)
            }
        };
        match rejected {
            None => {
                trace!(size = len, "returned large buffer");
                inner.sink.emit(Event::LargeBufferReturned { size: len, tag });
            }
            Some(buffer) => {
                drop(buffer);
                debug!(size = len, "large free pool at capacity, discarding buffer");
                inner.metrics.large_discarded.inc();
                inner.sink.emit(Event::LargeBufferDiscarded { size: len, tag });
            }
        }
    }

    /// Returns the size class index for a length that is already a positive
    /// multiple of the large granularity, or `None` if oversize.
    fn class_index(&self, len: usize) -> Option<usize> {
        if len > self.inner.max_buffer_size {
            return None;
        }
        Some(len / self.inner.large_buffer_multiple - 1)
    }

    // ---- streams ----

    /// Creates a stream backed by a single block.
    pub fn stream(&self, tag: Option<&str>) -> Stream {
        let block = self.get_block();
        self.make_stream(tag, vec![block], None, self.inner.block_size)
    }

    /// Creates a stream whose initial capacity covers `capacity` bytes,
    /// backed by the smallest sufficient chain of blocks.
    ///
    /// # Errors
    ///
    /// - [Error::OutOfRange] if `capacity` exceeds [MAX_STREAM_SIZE]
    /// - [Error::CapacityExceeded] if the pool's per-stream ceiling is set
    ///   and `capacity` exceeds it
    pub fn stream_with_capacity(
        &self,
        tag: Option<&str>,
        capacity: usize,
    ) -> Result<Stream, Error> {
        self.check_stream_capacity(capacity)?;
        let block_size = self.inner.block_size;
        let count = capacity.max(block_size).div_ceil(block_size);
        let blocks = (0..count).map(|_| self.get_block()).collect();
        Ok(self.make_stream(tag, blocks, None, capacity))
    }

    /// Creates a stream seeded with a single contiguous large buffer when
    /// `capacity` exceeds one block, so a later [Stream::get_buffer] needs no
    /// promotion copy. Falls back to block backing for small capacities.
    ///
    /// # Errors
    ///
    /// Same as [Pool::stream_with_capacity].
    pub fn stream_contiguous(&self, tag: Option<&str>, capacity: usize) -> Result<Stream, Error> {
        self.check_stream_capacity(capacity)?;
        if capacity <= self.inner.block_size {
            let block = self.get_block();
            return Ok(self.make_stream(tag, vec![block], None, capacity));
        }
        let large = self.get_large_buffer(capacity, tag);
        Ok(self.make_stream(tag, Vec::new(), Some(large), capacity))
    }

    /// Creates a stream whose initial content is a copy of `data`, with
    /// position 0 and length `data.len()`. The source slice is not retained.
    ///
    /// # Errors
    ///
    /// Same as [Pool::stream_with_capacity].
    pub fn stream_from_slice(&self, tag: Option<&str>, data: &[u8]) -> Result<Stream, Error> {
        let mut stream = self.stream_with_capacity(tag, data.len())?;
        stream.write(data)?;
        stream.set_position(0)?;
        Ok(stream)
    }

    /// Rejects stream capacity requests beyond the global or per-stream
    /// limits.
    fn check_stream_capacity(&self, capacity: usize) -> Result<(), Error> {
        if capacity > MAX_STREAM_SIZE {
            return Err(Error::OutOfRange);
        }
        let max = self.inner.max_stream_capacity.load(Ordering::Relaxed);
        if max > 0 && capacity > max {
            return Err(Error::CapacityExceeded);
        }
        Ok(())
    }

    fn make_stream(
        &self,
        tag: Option<&str>,
        blocks: Vec<Vec<u8>>,
        large: Option<Vec<u8>>,
        requested: usize,
    ) -> Stream {
        let inner = &self.inner;
        let sequence = inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let id = ((inner.id_salt as u128) << 64) | sequence as u128;
        inner.outstanding_streams.fetch_add(1, Ordering::Relaxed);
        inner.metrics.streams_created.inc();
        let capture = inner.capture_call_sites.load(Ordering::Relaxed);
        let stream = Stream::new(self.clone(), id, tag, blocks, large, capture);
        debug!(id = sequence, tag, "created stream");
        inner.sink.emit(Event::StreamCreated {
            id,
            tag,
            requested,
            actual: stream.capacity(),
        });
        stream
    }

    // ---- stream lifecycle accounting ----

    pub(crate) fn record_stream_closed(&self, id: u128, tag: Option<&str>) {
        let inner = &self.inner;
        saturating_sub(&inner.outstanding_streams, 1);
        inner.metrics.streams_closed.inc();
        inner.sink.emit(Event::StreamClosed { id, tag });
    }

    pub(crate) fn record_double_close(
        &self,
        id: u128,
        tag: Option<&str>,
        allocated_at: Option<&Backtrace>,
        closed_at: Option<&Backtrace>,
    ) {
        let inner = &self.inner;
        let id_hex = format!("{id:032x}");
        warn!(id = %id_hex, tag, "stream closed twice");
        inner.metrics.double_closes.inc();
        inner.sink.emit(Event::DoubleClose {
            id,
            tag,
            allocated_at,
            closed_at,
        });
    }

    pub(crate) fn record_stream_leaked(
        &self,
        id: u128,
        tag: Option<&str>,
        allocated_at: Option<&Backtrace>,
    ) {
        let inner = &self.inner;
        saturating_sub(&inner.outstanding_streams, 1);
        let id_hex = format!("{id:032x}");
        warn!(id = %id_hex, tag, "stream dropped without close");
        inner.metrics.streams_leaked.inc();
        inner.sink.emit(Event::StreamLeaked {
            id,
            tag,
            allocated_at,
        });
    }

    // ---- introspection ----

    /// Bytes currently checked out of the small pool.
    pub fn small_pool_in_use_bytes(&self) -> usize {
        self.inner.small_in_use.load(Ordering::Relaxed)
    }

    /// Bytes currently held in the small free pool.
    pub fn small_pool_free_bytes(&self) -> usize {
        self.inner.small_free.load(Ordering::Relaxed)
    }

    /// Bytes currently checked out of the large pool.
    pub fn large_pool_in_use_bytes(&self) -> usize {
        self.inner.large_in_use.load(Ordering::Relaxed)
    }

    /// Bytes currently held across all large free lists.
    pub fn large_pool_free_bytes(&self) -> usize {
        self.inner.large_free.load(Ordering::Relaxed)
    }

    /// Number of blocks in the small free pool.
    pub fn small_blocks_free(&self) -> usize {
        self.inner.small.lock().len()
    }

    /// Number of buffers across all large free lists.
    pub fn large_buffers_free(&self) -> usize {
        self.inner.large.lock().iter().map(Vec::len).sum()
    }

    /// Number of streams created and not yet closed or dropped.
    pub fn outstanding_streams(&self) -> usize {
        self.inner.outstanding_streams.load(Ordering::Relaxed)
    }

    // ---- runtime-mutable options ----

    /// Cap on free-block bytes retained by the small pool. Zero means
    /// unbounded.
    pub fn max_free_small_bytes(&self) -> usize {
        self.inner.max_free_small_bytes.load(Ordering::Relaxed)
    }

    /// Sets the small free-pool byte cap. Takes effect on subsequent returns;
    /// already-retained blocks are not evicted.
    pub fn set_max_free_small_bytes(&self, bytes: usize) {
        self.inner
            .max_free_small_bytes
            .store(bytes, Ordering::Relaxed);
    }

    /// Cap on free large-buffer bytes retained across all size classes. Zero
    /// means unbounded.
    pub fn max_free_large_bytes(&self) -> usize {
        self.inner.max_free_large_bytes.load(Ordering::Relaxed)
    }

    /// Sets the large free-pool byte cap. Takes effect on subsequent returns;
    /// already-retained buffers are not evicted.
    pub fn set_max_free_large_bytes(&self, bytes: usize) {
        self.inner
            .max_free_large_bytes
            .store(bytes, Ordering::Relaxed);
    }

    /// Per-stream capacity ceiling. Zero means unbounded.
    pub fn max_stream_capacity(&self) -> usize {
        self.inner.max_stream_capacity.load(Ordering::Relaxed)
    }

    /// Sets the per-stream capacity ceiling. A stream always retains its
    /// single-block floor regardless of the ceiling.
    pub fn set_max_stream_capacity(&self, bytes: usize) {
        self.inner
            .max_stream_capacity
            .store(bytes, Ordering::Relaxed);
    }

    /// Whether superseded stream buffers return to the pool immediately
    /// (aggressive) instead of accumulating until stream close (passive).
    pub fn aggressive_buffer_return(&self) -> bool {
        self.inner.aggressive_buffer_return.load(Ordering::Relaxed)
    }

    /// Sets the large-buffer release mode.
    pub fn set_aggressive_buffer_return(&self, aggressive: bool) {
        self.inner
            .aggressive_buffer_return
            .store(aggressive, Ordering::Relaxed);
    }

    /// Whether streams capture allocation and close call sites for leak
    /// diagnostics.
    pub fn capture_call_sites(&self) -> bool {
        self.inner.capture_call_sites.load(Ordering::Relaxed)
    }

    /// Toggles call-site capture for subsequently created streams.
    pub fn set_capture_call_sites(&self, capture: bool) {
        self.inner
            .capture_call_sites
            .store(capture, Ordering::Relaxed);
    }
}
