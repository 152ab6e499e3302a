use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard},
};

use nohash_hasher::BuildNoHashHasher;

use crate::context::Backtrace;

/// Stable identifier handed out for an interned backtrace.
///
/// Identifiers start at 1, so serialized references can use "absent" for
/// the empty backtrace without colliding with a real entry.
pub type BacktraceId = u32;

#[derive(Debug)]
struct StackTableInner {
  by_backtrace: HashMap<Backtrace, BacktraceId>,
  by_id: HashMap<BacktraceId, Backtrace, BuildNoHashHasher<BacktraceId>>,
  next_id: BacktraceId,
}

impl Default for StackTableInner {
  fn default() -> Self {
    Self {
      by_backtrace: HashMap::new(),
      by_id: HashMap::default(),
      next_id: 1,
    }
  }
}

/// Deduplicates backtraces into stable small-integer references.
#[derive(Debug, Default)]
pub struct StackTable {
  inner: Mutex<StackTableInner>,
}

impl StackTable {
  /// Interns `backtrace` and returns its identifier. Interning the same
  /// backtrace again returns the existing identifier.
  pub fn intern(&self, backtrace: Backtrace) -> BacktraceId {
    let mut inner = self.lock_inner();

    if let Some(existing) = inner.by_backtrace.get(&backtrace).copied() {
      return existing;
    }

    let id = inner.next_id;
    inner.next_id = inner.next_id.saturating_add(1);

    inner.by_backtrace.insert(backtrace, id);
    inner.by_id.insert(id, backtrace);

    id
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of distinct backtraces interned so far.
  #[must_use]
  pub fn len(&self) -> usize {
    self.lock_inner().by_backtrace.len()
  }

  fn lock_inner(&self) -> MutexGuard<'_, StackTableInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolves an identifier back to its backtrace, if known.
  #[must_use]
  pub fn resolve(&self, id: BacktraceId) -> Option<Backtrace> {
    self.lock_inner().by_id.get(&id).copied()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identifiers_start_at_one() {
    let table = StackTable::new();
    let id = table.intern(Backtrace::from_frames(&[0x10]));

    assert_eq!(id, 1);
  }

  #[test]
  fn interning_is_idempotent() {
    let table = StackTable::new();
    let backtrace = Backtrace::from_frames(&[0x10, 0x20]);

    let first = table.intern(backtrace);
    let second = table.intern(backtrace);

    assert_eq!(first, second);
    assert_eq!(table.len(), 1);
  }

  #[test]
  fn distinct_backtraces_get_distinct_identifiers() {
    let table = StackTable::new();

    let a = table.intern(Backtrace::from_frames(&[0x10]));
    let b = table.intern(Backtrace::from_frames(&[0x20]));

    assert_ne!(a, b);
    assert_eq!(table.len(), 2);
  }

  #[test]
  fn resolves_interned_backtraces() {
    let table = StackTable::new();
    let backtrace = Backtrace::from_frames(&[0x10, 0x20, 0x30]);

    let id = table.intern(backtrace);

    assert_eq!(table.resolve(id), Some(backtrace));
    assert_eq!(table.resolve(id + 1), None);
  }
}
