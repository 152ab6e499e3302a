//! Live-allocation tracking and grouped heap-dump reporting.
//!
//! The crate pairs a fixed-capacity, address-keyed allocation index,
//! purpose-built for allocator hook traffic, with a single-shot aggregator
//! that groups the live set by call stack and object type into a
//! serializable heap dump. [`HeapProfiler`] ties the pieces together
//! behind one shared handle.

mod aggregator;
mod capture;
mod config;
mod context;
mod index;
mod pprof;
mod profiler;
mod report;
mod stack_table;

use {
  memmap2::MmapMut,
  prost::Message,
  serde::{Serialize, Serializer, ser::SerializeStruct},
  std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    io::{self, Write},
    mem::size_of,
    num::NonZeroU32,
  },
};

pub use {
  aggregator::HeapDumpAggregator,
  capture::FrameCapture,
  config::ProfilerConfig,
  context::{
    Allocation, AllocationContext, Backtrace, MAX_FRAMES, StackFrame, TypeTag,
  },
  index::{AllocationIndex, Allocations, OverheadEstimate},
  pprof::{
    Function, Label, Line, Location, Mapping, Profile, Sample, ValueType,
    build_pprof_profile,
  },
  profiler::{HeapProfiler, ProfilerBuilder},
  report::{
    DumpRecord, DumpRecordKind, DumpSink, ExportError, HeapDump,
    JsonLinesSink, format_size,
  },
  stack_table::{BacktraceId, StackTable},
};
