use std::backtrace::Backtrace;

/// A notification emitted by a [crate::Pool] or one of its streams.
///
/// Sizes are in bytes. Where both appear, `requested` is what the caller
/// asked for and `actual` is the length actually handed out after rounding to
/// pool granularity.
#[derive(Debug)]
pub enum Event<'a> {
    /// A stream was allocated.
    StreamCreated {
        id: u128,
        tag: Option<&'a str>,
        requested: usize,
        actual: usize,
    },
    /// A stream was closed and returned its buffers.
    StreamClosed { id: u128, tag: Option<&'a str> },
    /// A fresh block was allocated because the small free pool was empty.
    BlockCreated { size: usize },
    /// Blocks were accepted back into the small free pool.
    BlockReturned { count: usize, tag: Option<&'a str> },
    /// A returned block was dropped because the small free pool is at its
    /// byte cap.
    BlockDiscarded { size: usize, tag: Option<&'a str> },
    /// A fresh large buffer was allocated. `pooled` is false for oversize
    /// buffers, which never return to the pool.
    LargeBufferCreated {
        requested: usize,
        actual: usize,
        pooled: bool,
        tag: Option<&'a str>,
    },
    /// A large buffer was accepted back into its size-class free list.
    LargeBufferReturned { size: usize, tag: Option<&'a str> },
    /// A returned large buffer was dropped, either because it is oversize or
    /// because the large free pool is at its byte cap.
    LargeBufferDiscarded { size: usize, tag: Option<&'a str> },
    /// `close` was called on an already-closed stream.
    DoubleClose {
        id: u128,
        tag: Option<&'a str>,
        allocated_at: Option<&'a Backtrace>,
        closed_at: Option<&'a Backtrace>,
    },
    /// A stream was dropped without an explicit close. Its buffers were still
    /// returned to the pool.
    StreamLeaked {
        id: u128,
        tag: Option<&'a str>,
        allocated_at: Option<&'a Backtrace>,
    },
}

/// Receives [Event]s from a [crate::Pool] and its streams.
///
/// Implementations must be cheap and non-blocking: events are emitted inline
/// from allocation and return paths. No pool lock is held during `emit`.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event<'_>);
}

/// Discards every event. The default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: Event<'_>) {}
}
