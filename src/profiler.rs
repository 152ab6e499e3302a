use std::io;
use std::sync::{
  Arc, Mutex, MutexGuard,
  atomic::{AtomicBool, Ordering},
};

use crate::aggregator::HeapDumpAggregator;
use crate::capture::FrameCapture;
use crate::config::ProfilerConfig;
use crate::context::{AllocationContext, TypeTag};
use crate::index::{AllocationIndex, OverheadEstimate};
use crate::report::HeapDump;
use crate::stack_table::StackTable;

/// Thin builder that customizes `ProfilerConfig` without exposing all
/// knobs up front.
#[derive(Debug, Default)]
pub struct ProfilerBuilder {
  config: ProfilerConfig,
}

impl ProfilerBuilder {
  #[must_use]
  pub fn new() -> Self {
    Self {
      config: ProfilerConfig::default(),
    }
  }

  #[must_use]
  pub fn with_config(mut self, config: ProfilerConfig) -> Self {
    self.config = config;
    self
  }

  #[must_use]
  pub fn bucket_count(mut self, bucket_count: usize) -> Self {
    self.config.bucket_count = bucket_count;
    self
  }

  #[must_use]
  pub fn cells_per_bucket(mut self, cells_per_bucket: usize) -> Self {
    self.config.cells_per_bucket = cells_per_bucket;
    self
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: u16) -> Self {
    self.config.max_stack_depth = depth;
    self
  }

  #[must_use]
  pub fn skip_frames(mut self, skip: usize) -> Self {
    self.config.skip_frames = skip;
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }

  /// # Errors
  ///
  /// Returns an error if the index's address-space reservation fails.
  pub fn finish(self) -> io::Result<HeapProfiler> {
    HeapProfiler::with_config(self.config)
  }
}

#[derive(Debug)]
struct ProfilerInner {
  capture: FrameCapture,
  config: ProfilerConfig,
  enabled: AtomicBool,
  index: Mutex<AllocationIndex>,
  stack_table: StackTable,
}

/// Entry point for recording allocator traffic and writing grouped heap
/// dumps.
///
/// The profiler owns the single exclusive lock the allocation index
/// requires: hook calls and dump writing serialize through it, so the
/// index is quiesced for the whole of a dump. Handles are cheap clones of
/// one shared state; dropping the last handle releases the index's
/// reservations.
#[derive(Clone, Debug)]
pub struct HeapProfiler {
  inner: Arc<ProfilerInner>,
}

impl HeapProfiler {
  /// # Errors
  ///
  /// Returns an error if the index's address-space reservation fails.
  pub fn new() -> io::Result<Self> {
    Self::with_config(ProfilerConfig::default())
  }

  /// # Errors
  ///
  /// Returns an error if the index's address-space reservation fails.
  pub fn with_config(config: ProfilerConfig) -> io::Result<Self> {
    let index = AllocationIndex::new(&config)?;
    let inner = ProfilerInner {
      capture: FrameCapture::new(&config),
      enabled: AtomicBool::new(config.start_enabled),
      config,
      index: Mutex::new(index),
      stack_table: StackTable::new(),
    };

    Ok(Self {
      inner: Arc::new(inner),
    })
  }

  #[must_use]
  pub fn builder() -> ProfilerBuilder {
    ProfilerBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &ProfilerConfig {
    &self.inner.config
  }

  pub fn enable(&self) {
    self.inner.enabled.store(true, Ordering::Release);
  }

  pub fn disable(&self) {
    self.inner.enabled.store(false, Ordering::Release);
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    self.inner.enabled.load(Ordering::Acquire)
  }

  /// Records a fresh allocation, capturing the current call stack as its
  /// context. A no-op while the profiler is disabled.
  ///
  /// # Panics
  ///
  /// Panics if `address` is zero or the index capacity is exhausted; see
  /// [`crate::AllocationIndex::insert`].
  pub fn record_alloc(&self, address: usize, size: usize, type_tag: TypeTag) {
    if !self.enabled() {
      return;
    }

    let context =
      AllocationContext::new(self.inner.capture.capture(), type_tag);
    self.lock_index().insert(address, size, context);
  }

  /// Forgets a freed allocation. Safe to call for addresses that were
  /// never tracked (for example, allocations predating `enable`); a no-op
  /// while the profiler is disabled.
  pub fn record_free(&self, address: usize) {
    if !self.enabled() {
      return;
    }

    self.lock_index().remove(address);
  }

  /// Re-homes a moved allocation under a single lock acquisition, so no
  /// dump can observe the intermediate state. Expects a successful
  /// reallocation, meaning `new_address` is nonzero.
  ///
  /// # Panics
  ///
  /// Panics if `new_address` is zero or the index capacity is exhausted;
  /// see [`crate::AllocationIndex::insert`].
  pub fn record_realloc(
    &self,
    old_address: usize,
    new_address: usize,
    size: usize,
    type_tag: TypeTag,
  ) {
    if !self.enabled() {
      return;
    }

    let context =
      AllocationContext::new(self.inner.capture.capture(), type_tag);

    let mut index = self.lock_index();
    index.remove(old_address);
    index.insert(new_address, size, context);
  }

  /// Current memory cost of the tracking structures themselves, suitable
  /// for reporting alongside a dump.
  #[must_use]
  pub fn estimate_overhead(&self) -> OverheadEstimate {
    self.lock_index().estimate_overhead()
  }

  fn lock_index(&self) -> MutexGuard<'_, AllocationIndex> {
    match self.inner.index.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  /// The table that resolves the backtrace references a dump emits.
  #[must_use]
  pub fn stack_table(&self) -> &StackTable {
    &self.inner.stack_table
  }

  /// Writes a grouped dump of everything currently live.
  ///
  /// The index stays locked for the whole pass, so the dump is a
  /// consistent point-in-time view; each call feeds a fresh single-shot
  /// aggregator.
  #[must_use]
  pub fn write_heap_dump(&self) -> HeapDump {
    let index = self.lock_index();
    let mut aggregator = HeapDumpAggregator::new();

    for allocation in index.allocations() {
      aggregator.insert_allocation(&allocation.context, allocation.size);
    }

    aggregator.write_heap_dump(&self.inner.stack_table)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn shallow_profiler() -> HeapProfiler {
    // Depth zero keeps contexts deterministic: every allocation lands in
    // the empty-backtrace group.
    HeapProfiler::builder()
      .bucket_count(16)
      .cells_per_bucket(4)
      .max_stack_depth(0)
      .finish()
      .expect("reserve test profiler")
  }

  #[test]
  fn disabled_profiler_records_nothing() {
    let profiler = HeapProfiler::builder()
      .max_stack_depth(0)
      .start_enabled(false)
      .finish()
      .expect("reserve test profiler");

    profiler.record_alloc(0x10, 128, 1);
    assert_eq!(profiler.write_heap_dump().total_size(), 0);

    profiler.enable();
    profiler.record_alloc(0x10, 128, 1);
    assert_eq!(profiler.write_heap_dump().total_size(), 128);
  }

  #[test]
  fn tracks_allocs_and_frees() {
    let profiler = shallow_profiler();

    profiler.record_alloc(0x10, 100, 3);
    profiler.record_alloc(0x20, 50, 3);
    profiler.record_free(0x20);
    profiler.record_free(0xdead);

    let dump = profiler.write_heap_dump();
    assert_eq!(dump.total_size(), 100);

    let type_group = dump
      .records()
      .iter()
      .find(|record| record.type_tag == Some(3))
      .expect("type group for live bytes");
    assert_eq!(type_group.size, 100);
  }

  #[test]
  fn realloc_moves_the_tracked_address() {
    let profiler = shallow_profiler();

    profiler.record_alloc(0x10, 64, 2);
    profiler.record_realloc(0x10, 0x40, 96, 2);

    // The old address is gone, so freeing it again changes nothing.
    profiler.record_free(0x10);

    let dump = profiler.write_heap_dump();
    assert_eq!(dump.total_size(), 96);
  }

  #[test]
  #[should_panic(expected = "null address")]
  fn realloc_to_the_null_address_is_rejected() {
    let profiler = shallow_profiler();

    profiler.record_alloc(0x10, 64, 2);
    profiler.record_realloc(0x10, 0, 64, 2);
  }

  #[test]
  fn dumps_are_repeatable() {
    let profiler = shallow_profiler();
    profiler.record_alloc(0x10, 40, 1);

    let first = profiler.write_heap_dump();
    let second = profiler.write_heap_dump();

    assert_eq!(first.total_size(), 40);
    assert_eq!(first.records(), second.records());
  }

  #[test]
  fn captured_stacks_flow_into_dump_groups() {
    let profiler = HeapProfiler::builder()
      .bucket_count(16)
      .cells_per_bucket(4)
      .max_stack_depth(4)
      .finish()
      .expect("reserve test profiler");

    profiler.record_alloc(0x10, 32, 0);

    let dump = profiler.write_heap_dump();
    let group = dump.records()[1];
    let backtrace_ref =
      group.backtrace_ref.expect("captured stack is interned");

    let backtrace = profiler
      .stack_table()
      .resolve(backtrace_ref)
      .expect("reference resolves");
    assert!(!backtrace.is_empty());
  }

  #[test]
  fn overhead_tracks_recorded_allocations() {
    let profiler = shallow_profiler();
    let before = profiler.estimate_overhead();

    profiler.record_alloc(0x10, 8, 0);
    let after = profiler.estimate_overhead();

    assert!(after.resident_bytes > before.resident_bytes);
    assert_eq!(after.fixed_bytes, before.fixed_bytes);
  }
}
