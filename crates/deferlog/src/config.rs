use crate::frame::FRAME_ALIGNMENT;
use crate::queue::Extent;
use std::mem;

/// Assumed cache line size, used to derive the default output capacity.
const CACHE_LINE_SIZE: usize = 64;

/// Page size assumed when sizing the submission queue.
const PAGE_SIZE: usize = 4096;

/// Capacity configuration for a [`Log`](crate::Log).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Capacity in bytes of each per-thread input ring (default: 64 KiB).
    pub input_buffer_capacity: usize,
    /// Capacity in bytes of the consumer's output staging buffer.
    pub output_buffer_capacity: usize,
    /// Capacity in extents of the shared submission queue (power of two).
    pub queue_capacity: usize,
}

impl Config {
    /// Creates a configuration with explicit capacities.
    ///
    /// # Panics
    ///
    /// Panics if `input_buffer_capacity` is smaller than 1 KiB or not a
    /// multiple of the frame alignment, if `output_buffer_capacity` is
    /// smaller than 256 bytes, or if `queue_capacity` is not a power of two.
    pub fn new(
        input_buffer_capacity: usize,
        output_buffer_capacity: usize,
        queue_capacity: usize,
    ) -> Self {
        assert!(
            input_buffer_capacity >= 1024,
            "input buffer capacity must be at least 1 KiB"
        );
        assert!(
            input_buffer_capacity % FRAME_ALIGNMENT == 0,
            "input buffer capacity must be a multiple of the frame alignment"
        );
        assert!(
            output_buffer_capacity >= 256,
            "output buffer capacity must be at least 256 bytes"
        );
        assert!(
            queue_capacity.is_power_of_two(),
            "queue capacity must be a power of two"
        );
        Self {
            input_buffer_capacity,
            output_buffer_capacity,
            queue_capacity,
        }
    }

    /// Default input ring capacity per producer thread.
    pub const fn default_input_buffer_capacity() -> usize {
        64 * 1024
    }

    /// Default output capacity derived from the input capacity: assume one
    /// input frame per cache line and an 80-byte formatted line for each.
    pub const fn default_output_buffer_capacity(input_buffer_capacity: usize) -> usize {
        let assumed_frames = (input_buffer_capacity + CACHE_LINE_SIZE - 1) / CACHE_LINE_SIZE;
        assumed_frames * 80
    }

    /// Default queue capacity: about one page worth of extents.
    pub fn default_queue_capacity() -> usize {
        let per_page = PAGE_SIZE / mem::size_of::<Extent>();
        1 << per_page.ilog2()
    }
}

impl Default for Config {
    fn default() -> Self {
        let input = Self::default_input_buffer_capacity();
        Self::new(
            input,
            Self::default_output_buffer_capacity(input),
            Self::default_queue_capacity(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.input_buffer_capacity, 64 * 1024);
        assert_eq!(config.output_buffer_capacity, 1024 * 80);
        assert!(config.queue_capacity.is_power_of_two());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_odd_queue_capacity() {
        let _ = Config::new(64 * 1024, 4096, 100);
    }

    #[test]
    #[should_panic(expected = "at least 1 KiB")]
    fn test_rejects_tiny_input_buffer() {
        let _ = Config::new(512, 4096, 128);
    }
}
