use super::*;

/// Captures native call stacks as raw instruction-pointer backtraces.
///
/// Frames are recorded unresolved; symbolization is deferred to whatever
/// consumes the exported dump.
#[derive(Debug, Clone)]
pub struct FrameCapture {
  max_depth: usize,
  skip_frames: usize,
}

impl FrameCapture {
  /// Walks the current thread's stack and returns up to the configured
  /// depth of frames, innermost first, after dropping the configured skip
  /// prefix. A depth of zero disables capture and yields the empty
  /// backtrace.
  #[must_use]
  pub fn capture(&self) -> Backtrace {
    if self.max_depth == 0 {
      return Backtrace::empty();
    }

    let mut backtrace = Backtrace::empty();
    let mut remaining_skip = self.skip_frames;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if !backtrace.push(frame.ip() as usize) {
        return false;
      }

      backtrace.len() < self.max_depth
    });

    backtrace
  }

  #[must_use]
  pub fn new(config: &ProfilerConfig) -> Self {
    Self {
      max_depth: usize::from(config.max_stack_depth).min(MAX_FRAMES),
      skip_frames: config.skip_frames,
    }
  }
}
