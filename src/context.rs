/// One captured call-stack frame, stored as a raw program-counter value.
pub type StackFrame = usize;

/// Tag identifying the object type behind an allocation; `0` means the type
/// is unknown.
pub type TypeTag = u16;

/// Hard cap on frames retained per backtrace.
pub const MAX_FRAMES: usize = 16;

/// Fixed-capacity call-stack fingerprint attached to allocations.
///
/// Slots past `len` stay zeroed, so the derived equality and hash over the
/// full array agree for any two values holding the same frames. The
/// all-zero value is the canonical empty backtrace, which doubles as the
/// content of untouched, zero-filled cell storage.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Backtrace {
  frames: [StackFrame; MAX_FRAMES],
  len: u32,
}

impl Backtrace {
  /// The backtrace with no frames ("no stack available").
  #[must_use]
  pub fn empty() -> Self {
    Self {
      frames: [0; MAX_FRAMES],
      len: 0,
    }
  }

  /// Frames in innermost-first order.
  #[must_use]
  pub fn frames(&self) -> &[StackFrame] {
    &self.frames[..self.len as usize]
  }

  /// Builds a backtrace from up to [`MAX_FRAMES`] frames; extras are
  /// dropped.
  #[must_use]
  pub fn from_frames(frames: &[StackFrame]) -> Self {
    let mut backtrace = Self::empty();

    for frame in frames.iter().take(MAX_FRAMES) {
      backtrace.frames[backtrace.len as usize] = *frame;
      backtrace.len += 1;
    }

    backtrace
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.len as usize
  }

  /// Appends a frame, returning whether there was room for it.
  pub fn push(&mut self, frame: StackFrame) -> bool {
    if (self.len as usize) < MAX_FRAMES {
      self.frames[self.len as usize] = frame;
      self.len += 1;
      true
    } else {
      false
    }
  }
}

impl Default for Backtrace {
  fn default() -> Self {
    Self::empty()
  }
}

/// Opaque grouping key for an allocation: where it was allocated and what
/// type it holds.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct AllocationContext {
  /// Call stack at allocation time; empty when no frames were captured.
  pub backtrace: Backtrace,
  /// Object type of the allocation; `0` when unknown.
  pub type_tag: TypeTag,
}

impl AllocationContext {
  #[must_use]
  pub fn new(backtrace: Backtrace, type_tag: TypeTag) -> Self {
    Self {
      backtrace,
      type_tag,
    }
  }
}

/// A live allocation as stored by the index.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
  /// Address of the allocation; never zero for a live entry, since zero is
  /// the free-cell marker.
  pub address: usize,
  /// Grouping key captured when the allocation was recorded.
  pub context: AllocationContext,
  /// Most recently recorded size in bytes.
  pub size: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_frames_truncates_at_capacity() {
    let frames: Vec<StackFrame> = (1..=MAX_FRAMES + 4).collect();
    let backtrace = Backtrace::from_frames(&frames);

    assert_eq!(backtrace.len(), MAX_FRAMES);
    assert_eq!(backtrace.frames(), &frames[..MAX_FRAMES]);
  }

  #[test]
  fn construction_routes_agree() {
    let via_slice = Backtrace::from_frames(&[0x10, 0x20]);

    let mut via_push = Backtrace::empty();
    assert!(via_push.push(0x10));
    assert!(via_push.push(0x20));

    assert_eq!(via_slice, via_push);
  }

  #[test]
  fn equality_tracks_frame_count() {
    let short = Backtrace::from_frames(&[0x10, 0x20]);
    let long = Backtrace::from_frames(&[0x10, 0x20, 0x30]);

    assert_ne!(short, long);
  }

  #[test]
  fn push_reports_exhausted_capacity() {
    let mut backtrace = Backtrace::empty();

    for frame in 0..MAX_FRAMES {
      assert!(backtrace.push(frame + 1));
    }

    assert!(!backtrace.push(0xdead));
    assert_eq!(backtrace.len(), MAX_FRAMES);
  }

  #[test]
  fn default_is_empty() {
    let backtrace = Backtrace::default();

    assert!(backtrace.is_empty());
    assert!(backtrace.frames().is_empty());
  }
}
