use heaptrace::{HeapProfiler, ProfilerConfig};

fn main() -> std::io::Result<()> {
  let config = ProfilerConfig::default().with_max_stack_depth(4);
  let profiler = HeapProfiler::with_config(config)?;

  profiler.record_alloc(0x1000, 128, 1);
  profiler.record_alloc(0x2000, 64, 2);
  profiler.record_alloc(0x3000, 64, 1);
  profiler.record_free(0x2000);
  profiler.record_realloc(0x3000, 0x4000, 96, 1);

  let dump = profiler.write_heap_dump();

  println!("=== demo heap dump ===");
  for record in dump.records() {
    let bt = record
      .backtrace_ref
      .map_or_else(|| "-".to_string(), |id| id.to_string());
    let type_tag = record
      .type_tag
      .map_or_else(|| "-".to_string(), |tag| tag.to_string());
    println!("bt={bt} type={type_tag} size={}", record.size);
  }

  println!("total live: {} bytes", dump.total_size());

  let overhead = profiler.estimate_overhead();
  println!(
    "tracking overhead: {} bytes resident (capacity {} entries)",
    overhead.resident_bytes,
    profiler.config().cell_count()
  );

  Ok(())
}
