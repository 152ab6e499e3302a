use super::*;

/// Index of one cell in the arena.
///
/// Wraps `NonZeroU32` so the all-zero bit pattern is reserved for "no
/// cell": bucket heads, chain links and the free-list head are
/// `Option<CellRef>`, which the niche encoding stores in the same four
/// bytes with `None` as zero. A freshly mapped, zero-filled region is
/// therefore a valid empty table, and no live entry can claim index zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct CellRef(NonZeroU32);

impl CellRef {
  fn from_raw(raw: u32) -> Option<Self> {
    NonZeroU32::new(raw).map(CellRef)
  }

  fn index(self) -> usize {
    self.0.get() as usize
  }
}

/// Storage unit of the arena: one allocation plus the link to the next
/// cell in the same bucket chain, or, for recycled cells, the next cell on
/// the free list.
#[derive(Debug, Clone, Copy)]
struct Cell {
  allocation: Allocation,
  next: Option<CellRef>,
}

/// Memory cost estimate for an [`AllocationIndex`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OverheadEstimate {
  /// Size of the index structure itself.
  pub fixed_bytes: usize,
  /// Fixed size plus every byte of cell and bucket storage the index has
  /// touched. Reserved but untouched pages are excluded: they have no
  /// physical backing yet.
  pub resident_bytes: usize,
}

/// Fixed-capacity, address-keyed table of the process's live allocations.
///
/// Purpose-built for an allocator hook's traffic: an insert per
/// allocation, a remove per free, no iteration during steady state.
/// Storage is two anonymous demand-zero reservations, a cell arena and a
/// bucket-head array, mapped once at construction and released on drop.
/// Physical pages materialize only when first touched, so resident memory
/// follows the arena's high-water mark rather than its capacity.
///
/// Capacity never grows. Filling every cell is a hard failure (see
/// [`AllocationIndex::insert`]); cells freed by [`AllocationIndex::remove`]
/// are recycled through an index-threaded free list before fresh storage
/// is touched.
#[derive(Debug)]
pub struct AllocationIndex {
  bucket_count: usize,
  buckets: MmapMut,
  cell_capacity: u32,
  cells: MmapMut,
  free_list: Option<CellRef>,
  next_unused_cell: u32,
}

impl AllocationIndex {
  /// Reserves an index sized by `config`.
  ///
  /// # Errors
  ///
  /// Returns an error if either address-space reservation fails.
  pub fn new(config: &ProfilerConfig) -> io::Result<Self> {
    Self::with_capacity(config.bucket_count, config.cells_per_bucket)
  }

  /// Reserves an index holding at most `bucket_count * cells_per_bucket`
  /// live entries. The arena gets one extra slot so the reserved zeroth
  /// cell does not eat into that capacity.
  ///
  /// # Errors
  ///
  /// Returns an error if either address-space reservation fails.
  ///
  /// # Panics
  ///
  /// Panics if `bucket_count` is not a power of two, if `cells_per_bucket`
  /// is zero, or if the cell count does not fit the 32-bit cell index.
  pub fn with_capacity(
    bucket_count: usize,
    cells_per_bucket: usize,
  ) -> io::Result<Self> {
    assert!(
      bucket_count.is_power_of_two(),
      "bucket count must be a power of two"
    );
    assert!(cells_per_bucket > 0, "cells per bucket must be nonzero");

    let cell_count = bucket_count
      .checked_mul(cells_per_bucket)
      .filter(|count| *count < u32::MAX as usize)
      .expect("cell capacity must fit a 32-bit cell index");

    let cells = MmapMut::map_anon((cell_count + 1) * size_of::<Cell>())?;
    let buckets = MmapMut::map_anon(bucket_count * size_of::<u32>())?;

    Ok(Self {
      bucket_count,
      buckets,
      cell_capacity: cell_count as u32,
      cells,
      free_list: None,
      next_unused_cell: 1,
    })
  }

  /// Iterates every live allocation, in cell order.
  ///
  /// The scan walks the touched cell range directly instead of the bucket
  /// chains, so a full pass costs the high-water mark, not the capacity.
  /// Each call starts a fresh pass; the table cannot be mutated while an
  /// iterator borrows it.
  #[must_use]
  pub fn allocations(&self) -> Allocations<'_> {
    Allocations {
      index: self,
      next_cell: 1,
    }
  }

  fn bucket_head(&self, bucket: usize) -> Option<CellRef> {
    debug_assert!(bucket < self.bucket_count);
    // SAFETY: `bucket` is masked into `0..bucket_count` and the reservation
    // holds `bucket_count` four-byte slots; zero-filled slots decode to
    // `None`.
    CellRef::from_raw(unsafe {
      self.buckets.as_ptr().cast::<u32>().add(bucket).read()
    })
  }

  fn bucket_of(&self, address: usize) -> usize {
    // Multiplicative hashing, per Knuth: allocator alignment clusters the
    // low address bits, and the multiply-and-shift spreads them before
    // masking.
    const MULTIPLIER: usize = 131_101;
    const SHIFT: u32 = 15;

    (address.wrapping_mul(MULTIPLIER) >> SHIFT) & (self.bucket_count - 1)
  }

  /// Hard cap on simultaneously live entries.
  #[must_use]
  pub fn capacity(&self) -> usize {
    self.cell_capacity as usize
  }

  fn cell(&self, cell_ref: CellRef) -> &Cell {
    debug_assert!(cell_ref.index() <= self.cell_capacity as usize);
    // SAFETY: the reservation holds `cell_capacity + 1` cells and
    // `cell_ref` is in `1..=cell_capacity`; the mapping is page-aligned,
    // which exceeds the cell alignment, and every bit pattern of `Cell` is
    // a valid value, the zero-filled pages of untouched storage included.
    unsafe { &*self.cells.as_ptr().cast::<Cell>().add(cell_ref.index()) }
  }

  fn cell_mut(&mut self, cell_ref: CellRef) -> &mut Cell {
    debug_assert!(cell_ref.index() <= self.cell_capacity as usize);
    // SAFETY: as in `cell`; `&mut self` makes the reference unique.
    unsafe {
      &mut *self.cells.as_mut_ptr().cast::<Cell>().add(cell_ref.index())
    }
  }

  /// Count of arena cells backed by touched memory: the reserved zeroth
  /// cell plus every cell ever assigned to an entry. Recycling through the
  /// free list does not advance it.
  #[must_use]
  pub fn cells_touched(&self) -> usize {
    self.next_unused_cell as usize
  }

  fn chain_find(&self, bucket: usize, address: usize) -> Option<CellRef> {
    let mut next = self.bucket_head(bucket);

    while let Some(cell_ref) = next {
      let cell = self.cell(cell_ref);
      if cell.allocation.address == address {
        return Some(cell_ref);
      }
      next = cell.next;
    }

    None
  }

  /// Estimates the memory the index itself consumes, counting only storage
  /// that has been touched and therefore has physical backing.
  #[must_use]
  pub fn estimate_overhead(&self) -> OverheadEstimate {
    let fixed_bytes = size_of::<Self>();
    let cell_bytes = self.next_unused_cell as usize * size_of::<Cell>();
    let bucket_bytes = self.bucket_count * size_of::<u32>();

    OverheadEstimate {
      fixed_bytes,
      resident_bytes: fixed_bytes + cell_bytes + bucket_bytes,
    }
  }

  /// Looks up the live allocation recorded for `address`, if any.
  #[must_use]
  pub fn get(&self, address: usize) -> Option<&Allocation> {
    let cell_ref = self.chain_find(self.bucket_of(address), address)?;
    Some(&self.cell(cell_ref).allocation)
  }

  /// Records `address` as live with the given size and context. Inserting
  /// an address that is already live overwrites its size and context in
  /// place; the older values are not kept.
  ///
  /// # Panics
  ///
  /// Panics if `address` is zero (reserved as the free-cell marker), or if
  /// the insert would exceed the reserved cell capacity. The table never
  /// grows; the capacity panic fires before any state is modified.
  pub fn insert(
    &mut self,
    address: usize,
    size: usize,
    context: AllocationContext,
  ) {
    assert!(address != 0, "cannot track the null address");

    let bucket = self.bucket_of(address);

    if let Some(cell_ref) = self.chain_find(bucket, address) {
      let allocation = &mut self.cell_mut(cell_ref).allocation;
      allocation.context = context;
      allocation.size = size;
      return;
    }

    let cell_ref = self.take_free_cell();
    let head = self.bucket_head(bucket);

    let cell = self.cell_mut(cell_ref);
    cell.allocation = Allocation {
      address,
      context,
      size,
    };
    cell.next = head;

    self.set_bucket_head(bucket, Some(cell_ref));
  }

  /// Forgets `address` if it is currently tracked. Removing an absent or
  /// already removed address is a no-op: allocator hooks are routinely
  /// asked to forget allocations that predate tracking.
  pub fn remove(&mut self, address: usize) {
    let bucket = self.bucket_of(address);

    let mut previous: Option<CellRef> = None;
    let mut next = self.bucket_head(bucket);

    while let Some(cell_ref) = next {
      let cell = self.cell(cell_ref);

      if cell.allocation.address == address {
        let follower = cell.next;
        match previous {
          Some(previous) => self.cell_mut(previous).next = follower,
          None => self.set_bucket_head(bucket, follower),
        }

        let free_head = self.free_list;
        let cell = self.cell_mut(cell_ref);
        cell.allocation.address = 0;
        cell.next = free_head;
        self.free_list = Some(cell_ref);
        return;
      }

      previous = Some(cell_ref);
      next = cell.next;
    }
  }

  fn set_bucket_head(&mut self, bucket: usize, head: Option<CellRef>) {
    debug_assert!(bucket < self.bucket_count);
    // SAFETY: as in `bucket_head`; `&mut self` makes the access exclusive.
    unsafe {
      self
        .buckets
        .as_mut_ptr()
        .cast::<u32>()
        .add(bucket)
        .write(head.map_or(0, |cell| cell.0.get()));
    }
  }

  /// Takes a cell for a new entry, preferring recycled cells over
  /// advancing the high-water mark.
  fn take_free_cell(&mut self) -> CellRef {
    if let Some(cell_ref) = self.free_list {
      self.free_list = self.cell(cell_ref).next;
      return cell_ref;
    }

    assert!(
      self.next_unused_cell <= self.cell_capacity,
      "allocation index capacity exhausted: all {} cells are in use",
      self.cell_capacity,
    );

    let cell_ref = CellRef(
      NonZeroU32::new(self.next_unused_cell)
        .expect("high-water mark starts at one"),
    );
    self.next_unused_cell += 1;
    cell_ref
  }
}

/// Forward-only iterator over the live entries of an [`AllocationIndex`].
#[derive(Debug)]
pub struct Allocations<'a> {
  index: &'a AllocationIndex,
  next_cell: u32,
}

impl<'a> Iterator for Allocations<'a> {
  type Item = &'a Allocation;

  fn next(&mut self) -> Option<Self::Item> {
    while self.next_cell < self.index.next_unused_cell {
      let cell_ref = CellRef(
        NonZeroU32::new(self.next_cell).expect("cell scan starts at one"),
      );
      self.next_cell += 1;

      let allocation = &self.index.cell(cell_ref).allocation;
      if allocation.address != 0 {
        return Some(allocation);
      }
    }

    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn context(type_tag: TypeTag) -> AllocationContext {
    AllocationContext::new(Backtrace::empty(), type_tag)
  }

  fn small_index() -> AllocationIndex {
    AllocationIndex::with_capacity(8, 4).expect("reserve test index")
  }

  fn live_address_or(index: &AllocationIndex) -> usize {
    index.allocations().fold(0, |or, allocation| or | allocation.address)
  }

  #[test]
  fn live_set_follows_inserts_and_removes() {
    let mut index = small_index();

    index.insert(0x1, 0, context(0));
    index.insert(0x2, 0, context(0));
    index.insert(0x4, 0, context(0));
    assert_eq!(live_address_or(&index), 0x7);

    index.remove(0x2);
    assert_eq!(live_address_or(&index), 0x5);

    index.remove(0x4);
    assert_eq!(live_address_or(&index), 0x1);

    index.remove(0x1);
    assert_eq!(live_address_or(&index), 0x0);
    assert_eq!(index.allocations().count(), 0);
  }

  #[test]
  fn reinserting_overwrites_in_place() {
    let mut index = small_index();

    index.insert(0x10, 11, context(3));
    let first = index.get(0x10).expect("first insert is live");
    assert_eq!(first.size, 11);
    assert_eq!(first.context.type_tag, 3);

    index.insert(0x10, 13, context(5));
    let second = index.get(0x10).expect("address stays live");
    assert_eq!(second.size, 13);
    assert_eq!(second.context.type_tag, 5);

    assert_eq!(index.allocations().count(), 1);
  }

  #[test]
  fn remove_is_idempotent() {
    let mut index = small_index();

    index.insert(0x10, 32, context(0));
    index.remove(0x10);
    index.remove(0x10);
    index.remove(0xbeef);

    assert_eq!(index.allocations().count(), 0);
    assert!(index.get(0x10).is_none());
  }

  #[test]
  fn free_list_recycles_cells() {
    let mut index = small_index();
    let capacity = index.capacity();

    for n in 0..capacity {
      index.insert(0x1000 + n * 8, 16, context(0));
    }
    assert_eq!(index.cells_touched(), capacity + 1);

    for n in 0..capacity {
      index.remove(0x1000 + n * 8);
    }

    // A second full round must run entirely on recycled cells.
    for n in 0..capacity {
      index.insert(0x9000 + n * 8, 16, context(0));
    }

    assert_eq!(index.cells_touched(), capacity + 1);
    assert_eq!(index.allocations().count(), capacity);
  }

  #[test]
  fn freed_cells_chain_through_the_free_list() {
    let mut index = small_index();

    index.insert(0x10, 1, context(0));
    index.insert(0x20, 2, context(0));
    index.insert(0x30, 3, context(0));
    let touched = index.cells_touched();

    // Two removals stack two cells on the free list; both must come back
    // before fresh storage is touched.
    index.remove(0x10);
    index.remove(0x20);

    index.insert(0x40, 4, context(0));
    index.insert(0x50, 5, context(0));

    assert_eq!(index.cells_touched(), touched);
    assert_eq!(index.get(0x30).expect("untouched entry is live").size, 3);
    assert_eq!(index.get(0x40).expect("recycled entry is live").size, 4);
    assert_eq!(index.get(0x50).expect("recycled entry is live").size, 5);
    assert_eq!(index.allocations().count(), 3);
  }

  #[test]
  fn chains_disambiguate_bucket_collisions() {
    // Two buckets force long chains no matter how addresses hash.
    let mut index =
      AllocationIndex::with_capacity(2, 16).expect("reserve test index");

    for n in 1..=24 {
      index.insert(n * 0x40, n, context(0));
    }

    for n in 1..=24 {
      let allocation = index.get(n * 0x40).expect("collided entry is live");
      assert_eq!(allocation.size, n);
    }

    assert_eq!(index.allocations().count(), 24);
  }

  #[test]
  fn churn_matches_reference_model() {
    let mut index =
      AllocationIndex::with_capacity(16, 8).expect("reserve test index");
    let mut model: HashMap<usize, usize> = HashMap::new();

    // Mixed insert/remove traffic from a fixed linear congruential stream.
    let mut state: u64 = 0x5eed;
    for _ in 0..400 {
      state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
      let address = 0x8 + (state as usize % 97) * 16;
      let size = (state >> 32) as usize % 4096;

      if state % 3 == 0 {
        index.remove(address);
        model.remove(&address);
      } else if model.len() < index.capacity() {
        index.insert(address, size, context(0));
        model.insert(address, size);
      }
    }

    assert_eq!(index.allocations().count(), model.len());
    for allocation in index.allocations() {
      assert_eq!(model.get(&allocation.address), Some(&allocation.size));
    }
  }

  #[test]
  fn iteration_restarts_from_the_beginning() {
    let mut index = small_index();

    index.insert(0x10, 1, context(0));
    index.insert(0x20, 2, context(0));

    let first: Vec<usize> =
      index.allocations().map(|allocation| allocation.address).collect();
    let second: Vec<usize> =
      index.allocations().map(|allocation| allocation.address).collect();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
  }

  #[test]
  fn overhead_counts_touched_cells_only() {
    let mut index = small_index();
    let fixed = size_of::<AllocationIndex>();
    let bucket_bytes = 8 * size_of::<u32>();

    let empty = index.estimate_overhead();
    assert_eq!(empty.fixed_bytes, fixed);
    assert_eq!(empty.resident_bytes, fixed + size_of::<Cell>() + bucket_bytes);

    index.insert(0x10, 1, context(0));
    index.insert(0x20, 1, context(0));
    index.insert(0x30, 1, context(0));

    let touched = index.estimate_overhead();
    assert_eq!(
      touched.resident_bytes,
      fixed + 4 * size_of::<Cell>() + bucket_bytes
    );

    // Churn over recycled cells leaves the estimate unchanged.
    index.remove(0x20);
    index.insert(0x40, 1, context(0));
    assert_eq!(
      index.estimate_overhead().resident_bytes,
      touched.resident_bytes
    );
  }

  #[test]
  fn removed_address_can_be_tracked_again() {
    let mut index = small_index();

    index.insert(0x10, 8, context(1));
    index.remove(0x10);
    index.insert(0x10, 24, context(2));

    let allocation = index.get(0x10).expect("revived entry is live");
    assert_eq!(allocation.size, 24);
    assert_eq!(allocation.context.type_tag, 2);
  }

  #[test]
  #[should_panic(expected = "capacity exhausted")]
  fn filling_past_capacity_is_fatal() {
    let mut index =
      AllocationIndex::with_capacity(2, 2).expect("reserve test index");

    for n in 1..=5 {
      index.insert(n * 0x10, 8, context(0));
    }
  }

  #[test]
  #[should_panic(expected = "null address")]
  fn tracking_the_null_address_is_rejected() {
    let mut index = small_index();
    index.insert(0, 8, context(0));
  }
}
