//! Pooled byte-buffer streams that recycle their backing memory.
//!
//! Applications that produce many transient in-memory byte buffers pay for it
//! in allocator churn: every short-lived stream allocates, grows, and discards
//! its backing arrays. This crate keeps those arrays alive in a shared
//! [Pool] instead. A pool hands out [Stream]s backed by recycled memory and
//! takes the memory back when a stream is closed or dropped.
//!
//! # Two Tiers
//!
//! The pool manages two kinds of buffers:
//!
//! - **Blocks**: fixed-size arrays (`block_size` bytes each). A stream starts
//!   as a chain of blocks, acquiring more as it grows.
//! - **Large buffers**: contiguous arrays whose lengths are multiples of
//!   `large_buffer_multiple`, organized into size-class free lists up to
//!   `max_buffer_size`. When a caller needs the stream's content as a single
//!   slice ([Stream::get_buffer]), the block chain is promoted into one large
//!   buffer. Requests beyond `max_buffer_size` are satisfied with *oversize*
//!   buffers that are never pooled.
//!
//! Free pools are bounded by configurable byte caps; buffers returned above a
//! cap are dropped rather than retained.
//!
//! # Thread Safety
//!
//! [Pool] is a cheaply cloneable handle and is safe to share across threads.
//! An individual [Stream] is owned by one thread at a time.
//!
//! # Example
//!
//! ```
//! use prometheus_client::registry::Registry;
//! use slabstream::{Pool, PoolConfig};
//!
//! let mut registry = Registry::default();
//! let pool = Pool::new(PoolConfig::default(), &mut registry).unwrap();
//!
//! let mut stream = pool.stream(Some("example"));
//! stream.write(b"hello world").unwrap();
//! stream.set_position(0).unwrap();
//!
//! let mut buf = [0u8; 11];
//! assert_eq!(stream.read(&mut buf).unwrap(), 11);
//! assert_eq!(&buf, b"hello world");
//!
//! // Hand the backing memory back to the pool.
//! stream.close().unwrap();
//! ```

mod config;
mod events;
mod metrics;
mod pool;
mod stream;

pub use config::PoolConfig;
pub use events::{Event, EventSink, NoopSink};
pub use pool::Pool;
pub use stream::Stream;

use thiserror::Error;

/// The maximum logical size of a [Stream], in bytes.
///
/// Lengths, positions, and capacities never exceed this value.
pub const MAX_STREAM_SIZE: usize = i32::MAX as usize;

/// Errors returned by pool and stream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool construction parameters are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// A length or position exceeds [MAX_STREAM_SIZE].
    #[error("value exceeds maximum stream size")]
    OutOfRange,
    /// A returned buffer's length is not a valid pool size.
    #[error("returned buffer has invalid length {0}")]
    WrongSizedBuffer(usize),
    /// A seek resolved to a negative absolute position.
    #[error("seek before beginning of stream")]
    SeekBeforeBegin,
    /// A write would push the stream past [MAX_STREAM_SIZE]. The stream is
    /// left unchanged.
    #[error("write would exceed maximum stream size")]
    StreamOverflow,
    /// A capacity request exceeds the pool's per-stream ceiling. The stream
    /// is left unchanged.
    #[error("capacity exceeds maximum stream capacity")]
    CapacityExceeded,
    /// The stream has already been closed.
    #[error("stream closed")]
    Closed,
    /// An underlying writer failed during [Stream::write_to].
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            err @ (Error::SeekBeforeBegin | Error::OutOfRange) => {
                Self::new(std::io::ErrorKind::InvalidInput, err)
            }
            err => Self::new(std::io::ErrorKind::Other, err),
        }
    }
}
