use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for a [crate::Pool].
///
/// The byte gauges mirror the pool's atomic counters; the counters record
/// lifecycle edges (creation, discard, close, leak).
pub(crate) struct Metrics {
    /// Bytes currently checked out of the small pool.
    pub small_in_use_bytes: Gauge,
    /// Bytes currently held in the small free pool.
    pub small_free_bytes: Gauge,
    /// Bytes currently checked out of the large pool.
    pub large_in_use_bytes: Gauge,
    /// Bytes currently held across all large free lists.
    pub large_free_bytes: Gauge,
    /// Total blocks allocated fresh.
    pub blocks_created: Counter,
    /// Total returned blocks dropped because the small free pool was at its cap.
    pub blocks_discarded: Counter,
    /// Total pooled large buffers allocated fresh.
    pub large_created: Counter,
    /// Total oversize large buffers allocated.
    pub large_oversize: Counter,
    /// Total returned large buffers dropped (oversize or cap exceeded).
    pub large_discarded: Counter,
    /// Total streams created.
    pub streams_created: Counter,
    /// Total streams explicitly closed.
    pub streams_closed: Counter,
    /// Total close calls on already-closed streams.
    pub double_closes: Counter,
    /// Total streams dropped without an explicit close.
    pub streams_leaked: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            small_in_use_bytes: Gauge::default(),
            small_free_bytes: Gauge::default(),
            large_in_use_bytes: Gauge::default(),
            large_free_bytes: Gauge::default(),
            blocks_created: Counter::default(),
            blocks_discarded: Counter::default(),
            large_created: Counter::default(),
            large_oversize: Counter::default(),
            large_discarded: Counter::default(),
            streams_created: Counter::default(),
            streams_closed: Counter::default(),
            double_closes: Counter::default(),
            streams_leaked: Counter::default(),
        };

        registry.register(
            "pool_small_in_use_bytes",
            "Bytes currently checked out of the small pool",
            metrics.small_in_use_bytes.clone(),
        );
        registry.register(
            "pool_small_free_bytes",
            "Bytes currently held in the small free pool",
            metrics.small_free_bytes.clone(),
        );
        registry.register(
            "pool_large_in_use_bytes",
            "Bytes currently checked out of the large pool",
            metrics.large_in_use_bytes.clone(),
        );
        registry.register(
            "pool_large_free_bytes",
            "Bytes currently held across all large free lists",
            metrics.large_free_bytes.clone(),
        );
        registry.register(
            "pool_blocks_created",
            "Total blocks allocated fresh",
            metrics.blocks_created.clone(),
        );
        registry.register(
            "pool_blocks_discarded",
            "Total returned blocks dropped because the small free pool was at its cap",
            metrics.blocks_discarded.clone(),
        );
        registry.register(
            "pool_large_created",
            "Total pooled large buffers allocated fresh",
            metrics.large_created.clone(),
        );
        registry.register(
            "pool_large_oversize",
            "Total oversize large buffers allocated",
            metrics.large_oversize.clone(),
        );
        registry.register(
            "pool_large_discarded",
            "Total returned large buffers dropped",
            metrics.large_discarded.clone(),
        );
        registry.register(
            "pool_streams_created",
            "Total streams created",
            metrics.streams_created.clone(),
        );
        registry.register(
            "pool_streams_closed",
            "Total streams explicitly closed",
            metrics.streams_closed.clone(),
        );
        registry.register(
            "pool_double_closes",
            "Total close calls on already-closed streams",
            metrics.double_closes.clone(),
        );
        registry.register(
            "pool_streams_leaked",
            "Total streams dropped without an explicit close",
            metrics.streams_leaked.clone(),
        );

        metrics
    }
}
