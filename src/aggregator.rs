use std::collections::HashMap;

use nohash_hasher::BuildNoHashHasher;

use crate::context::{AllocationContext, Backtrace, TypeTag};
use crate::report::{DumpRecord, HeapDump};
use crate::stack_table::StackTable;

/// Groups a snapshot of live allocations into a serializable heap dump.
///
/// Use is single-shot: feed every live entry through
/// [`HeapDumpAggregator::insert_allocation`], then consume the aggregator
/// with [`HeapDumpAggregator::write_heap_dump`]. Each dump starts from a
/// fresh aggregator, so totals never leak across dumps.
#[derive(Debug, Default)]
pub struct HeapDumpAggregator {
  bytes_by_context: HashMap<AllocationContext, u64>,
}

impl HeapDumpAggregator {
  /// Accumulates `size` bytes against `context`. Cheap enough to call once
  /// per live entry while the dump holds the tracking lock.
  pub fn insert_allocation(
    &mut self,
    context: &AllocationContext,
    size: usize,
  ) {
    let total = self.bytes_by_context.entry(*context).or_default();
    *total = total.saturating_add(size as u64);
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Consumes the aggregator and produces the grouped dump: the grand
  /// total first, then per-backtrace totals and per-type totals, each in
  /// descending byte order. Backtraces become stable references through
  /// `stack_table`; the empty backtrace and the unknown type tag are
  /// emitted with their key absent.
  #[must_use]
  pub fn write_heap_dump(self, stack_table: &StackTable) -> HeapDump {
    let mut total_size: u64 = 0;
    let mut bytes_by_backtrace: HashMap<Backtrace, u64> = HashMap::new();
    let mut bytes_by_type: HashMap<TypeTag, u64, BuildNoHashHasher<TypeTag>> =
      HashMap::default();

    for (context, bytes) in self.bytes_by_context {
      total_size = total_size.saturating_add(bytes);

      let backtrace_total =
        bytes_by_backtrace.entry(context.backtrace).or_default();
      *backtrace_total = backtrace_total.saturating_add(bytes);

      let type_total = bytes_by_type.entry(context.type_tag).or_default();
      *type_total = type_total.saturating_add(bytes);
    }

    let mut backtrace_groups: Vec<(Backtrace, u64)> =
      bytes_by_backtrace.into_iter().collect();
    backtrace_groups.sort_by(|a, b| b.1.cmp(&a.1));

    let mut type_groups: Vec<(TypeTag, u64)> =
      bytes_by_type.into_iter().collect();
    type_groups.sort_by(|a, b| b.1.cmp(&a.1));

    let mut records =
      Vec::with_capacity(1 + backtrace_groups.len() + type_groups.len());
    records.push(DumpRecord::total(total_size));

    for (backtrace, bytes) in backtrace_groups {
      let backtrace_ref = if backtrace.is_empty() {
        None
      } else {
        Some(stack_table.intern(backtrace))
      };
      records.push(DumpRecord::backtrace_group(backtrace_ref, bytes));
    }

    for (type_tag, bytes) in type_groups {
      let tag = if type_tag == 0 { None } else { Some(type_tag) };
      records.push(DumpRecord::type_group(tag, bytes));
    }

    HeapDump::new(records)
  }
}
