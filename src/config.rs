use crate::context::MAX_FRAMES;

/// Controls the capacity of the allocation index and how call stacks are
/// captured.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
  /// Number of hash buckets; must be a power of two. Sized for the
  /// expected steady-state count of live allocations.
  pub bucket_count: usize,
  /// Cells reserved per bucket. The product with `bucket_count` is the
  /// hard cap on simultaneously live allocations; the headroom over one
  /// entry per bucket absorbs hash collisions and allocation bursts.
  pub cells_per_bucket: usize,
  /// Maximum number of frames captured per allocation, clamped to
  /// [`MAX_FRAMES`]. Zero disables stack capture entirely.
  pub max_stack_depth: u16,
  /// Innermost frames to drop from every capture, hiding the profiler's
  /// own hook machinery from reports.
  pub skip_frames: usize,
  /// Whether hooks record immediately once the profiler is constructed.
  pub start_enabled: bool,
}

impl Default for ProfilerConfig {
  fn default() -> Self {
    Self {
      bucket_count: 1 << 16,
      cells_per_bucket: 8,
      max_stack_depth: MAX_FRAMES as u16,
      skip_frames: 0,
      start_enabled: true,
    }
  }
}

impl ProfilerConfig {
  /// Total cell capacity implied by the bucket configuration.
  #[must_use]
  pub fn cell_count(&self) -> usize {
    self.bucket_count * self.cells_per_bucket
  }

  /// Explicitly disable eager profiling start-up.
  #[must_use]
  pub fn disabled(mut self) -> Self {
    self.start_enabled = false;
    self
  }

  /// Builder-style helper to adjust the capture depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: u16) -> Self {
    self.max_stack_depth = depth;
    self
  }
}
