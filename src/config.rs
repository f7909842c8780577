use crate::Error;

/// Configuration for a [crate::Pool].
///
/// The first three fields fix the pool's geometry and cannot change after
/// construction; the rest are initial values for options that remain mutable
/// at runtime through the pool's setters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of each pooled block, in bytes.
    pub block_size: usize,
    /// Granularity of large buffers: every large buffer's length is a
    /// multiple of this.
    pub large_buffer_multiple: usize,
    /// Largest large-buffer length the pool will retain. Requests beyond this
    /// are satisfied with oversize buffers that are never pooled. Must be a
    /// multiple of `large_buffer_multiple` and at least `block_size`.
    pub max_buffer_size: usize,
    /// Cap on free-block bytes retained by the small pool. Zero means
    /// unbounded.
    pub max_free_small_bytes: usize,
    /// Cap on free bytes retained across all large size classes. Zero means
    /// unbounded.
    pub max_free_large_bytes: usize,
    /// Per-stream capacity ceiling. Zero means unbounded.
    pub max_stream_capacity: usize,
    /// Whether superseded large buffers (and promoted-away blocks) return to
    /// the pool immediately instead of accumulating until stream close.
    pub aggressive_buffer_return: bool,
    /// Whether to capture stream allocation and close call sites for leak
    /// diagnostics.
    pub capture_call_sites: bool,
}

impl Default for PoolConfig {
    /// 16 KiB blocks, 1 MiB large-buffer granularity, 8 MiB pooled ceiling,
    /// unbounded free pools and stream capacity, passive release, no
    /// call-site capture.
    fn default() -> Self {
        Self {
            block_size: 16 * 1024,
            large_buffer_multiple: 1024 * 1024,
            max_buffer_size: 8 * 1024 * 1024,
            max_free_small_bytes: 0,
            max_free_large_bytes: 0,
            max_stream_capacity: 0,
            aggressive_buffer_return: false,
            capture_call_sites: false,
        }
    }
}

impl PoolConfig {
    /// Returns a copy of this config with a new block size.
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Returns a copy of this config with a new large-buffer granularity.
    pub const fn with_large_buffer_multiple(mut self, multiple: usize) -> Self {
        self.large_buffer_multiple = multiple;
        self
    }

    /// Returns a copy of this config with a new maximum pooled buffer size.
    pub const fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Returns a copy of this config with a new small free-pool byte cap.
    pub const fn with_max_free_small_bytes(mut self, bytes: usize) -> Self {
        self.max_free_small_bytes = bytes;
        self
    }

    /// Returns a copy of this config with a new large free-pool byte cap.
    pub const fn with_max_free_large_bytes(mut self, bytes: usize) -> Self {
        self.max_free_large_bytes = bytes;
        self
    }

    /// Returns a copy of this config with a new per-stream capacity ceiling.
    pub const fn with_max_stream_capacity(mut self, bytes: usize) -> Self {
        self.max_stream_capacity = bytes;
        self
    }

    /// Returns a copy of this config with a new large-buffer release mode.
    pub const fn with_aggressive_buffer_return(mut self, aggressive: bool) -> Self {
        self.aggressive_buffer_return = aggressive;
        self
    }

    /// Returns a copy of this config with call-site capture toggled.
    pub const fn with_capture_call_sites(mut self, capture: bool) -> Self {
        self.capture_call_sites = capture;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// [Error::InvalidConfiguration] when:
    /// - `block_size` is zero
    /// - `large_buffer_multiple` is zero
    /// - `max_buffer_size < block_size`
    /// - `max_buffer_size` is not a multiple of `large_buffer_multiple`
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfiguration(
                "block_size must be greater than zero",
            ));
        }
        if self.large_buffer_multiple == 0 {
            return Err(Error::InvalidConfiguration(
                "large_buffer_multiple must be greater than zero",
            ));
        }
        if self.max_buffer_size < self.block_size {
            return Err(Error::InvalidConfiguration(
                "max_buffer_size must be at least block_size",
            ));
        }
        if self.max_buffer_size % self.large_buffer_multiple != 0 {
            return Err(Error::InvalidConfiguration(
                "max_buffer_size must be a multiple of large_buffer_multiple",
            ));
        }
        Ok(())
    }

    /// Returns the number of large-buffer size classes.
    pub(crate) const fn num_classes(&self) -> usize {
        self.max_buffer_size / self.large_buffer_multiple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PoolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_size, 16 * 1024);
        assert_eq!(config.large_buffer_multiple, 1024 * 1024);
        assert_eq!(config.max_buffer_size, 8 * 1024 * 1024);
        assert_eq!(config.num_classes(), 8);
    }

    #[test]
    fn test_validate_rejects_zero_block_size() {
        let config = PoolConfig::default().with_block_size(0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_multiple() {
        let config = PoolConfig::default().with_large_buffer_multiple(0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_small_max_buffer_size() {
        let config = PoolConfig::default()
            .with_block_size(4096)
            .with_large_buffer_multiple(1024)
            .with_max_buffer_size(1024);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unaligned_max_buffer_size() {
        let config = PoolConfig::default()
            .with_block_size(16)
            .with_large_buffer_multiple(1000)
            .with_max_buffer_size(2500);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_num_classes() {
        let config = PoolConfig::default()
            .with_block_size(16)
            .with_large_buffer_multiple(64)
            .with_max_buffer_size(256);
        config.validate().unwrap();
        assert_eq!(config.num_classes(), 4);
    }

    #[test]
    fn test_builders() {
        let config = PoolConfig::default()
            .with_max_free_small_bytes(1024)
            .with_max_free_large_bytes(2048)
            .with_max_stream_capacity(4096)
            .with_aggressive_buffer_return(true)
            .with_capture_call_sites(true);

        assert_eq!(config.max_free_small_bytes, 1024);
        assert_eq!(config.max_free_large_bytes, 2048);
        assert_eq!(config.max_stream_capacity, 4096);
        assert!(config.aggressive_buffer_return);
        assert!(config.capture_call_sites);
    }
}
