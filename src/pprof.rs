use super::*;

/// The subset of the pprof profile schema needed for heap dumps, encoded
/// with prost. Field tags follow `profile.proto` from the pprof project.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Profile {
  #[prost(message, repeated, tag = "1")]
  pub sample_type: Vec<ValueType>,
  #[prost(message, repeated, tag = "2")]
  pub sample: Vec<Sample>,
  #[prost(message, repeated, tag = "3")]
  pub mapping: Vec<Mapping>,
  #[prost(message, repeated, tag = "4")]
  pub location: Vec<Location>,
  #[prost(message, repeated, tag = "5")]
  pub function: Vec<Function>,
  #[prost(string, repeated, tag = "6")]
  pub string_table: Vec<String>,
  #[prost(int64, tag = "7")]
  pub drop_frames: i64,
  #[prost(int64, tag = "8")]
  pub keep_frames: i64,
  #[prost(int64, tag = "9")]
  pub time_nanos: i64,
  #[prost(int64, tag = "10")]
  pub duration_nanos: i64,
  #[prost(message, optional, tag = "11")]
  pub period_type: Option<ValueType>,
  #[prost(int64, tag = "12")]
  pub period: i64,
  #[prost(int64, repeated, tag = "13")]
  pub comment: Vec<i64>,
  #[prost(int64, tag = "14")]
  pub default_sample_type: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ValueType {
  #[prost(int64, tag = "1")]
  pub ty: i64,
  #[prost(int64, tag = "2")]
  pub unit: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Sample {
  #[prost(uint64, repeated, tag = "1")]
  pub location_id: Vec<u64>,
  #[prost(int64, repeated, tag = "2")]
  pub value: Vec<i64>,
  #[prost(message, repeated, tag = "3")]
  pub label: Vec<Label>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Label {
  #[prost(int64, tag = "1")]
  pub key: i64,
  #[prost(int64, tag = "2")]
  pub str: i64,
  #[prost(int64, tag = "3")]
  pub num: i64,
  #[prost(int64, tag = "4")]
  pub num_unit: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Mapping {
  #[prost(uint64, tag = "1")]
  pub id: u64,
  #[prost(uint64, tag = "2")]
  pub memory_start: u64,
  #[prost(uint64, tag = "3")]
  pub memory_limit: u64,
  #[prost(uint64, tag = "4")]
  pub file_offset: u64,
  #[prost(int64, tag = "5")]
  pub filename: i64,
  #[prost(int64, tag = "6")]
  pub build_id: i64,
  #[prost(bool, tag = "7")]
  pub has_functions: bool,
  #[prost(bool, tag = "8")]
  pub has_filenames: bool,
  #[prost(bool, tag = "9")]
  pub has_line_numbers: bool,
  #[prost(bool, tag = "10")]
  pub has_inline_frames: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Location {
  #[prost(uint64, tag = "1")]
  pub id: u64,
  #[prost(uint64, tag = "2")]
  pub mapping_id: u64,
  #[prost(uint64, tag = "3")]
  pub address: u64,
  #[prost(message, repeated, tag = "4")]
  pub line: Vec<Line>,
  #[prost(bool, tag = "5")]
  pub is_folded: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Line {
  #[prost(uint64, tag = "1")]
  pub function_id: u64,
  #[prost(int64, tag = "2")]
  pub line: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Function {
  #[prost(uint64, tag = "1")]
  pub id: u64,
  #[prost(int64, tag = "2")]
  pub name: i64,
  #[prost(int64, tag = "3")]
  pub system_name: i64,
  #[prost(int64, tag = "4")]
  pub filename: i64,
  #[prost(int64, tag = "5")]
  pub start_line: i64,
}

struct StringTable {
  lookup: HashMap<String, i64>,
  strings: Vec<String>,
}

impl StringTable {
  fn intern(&mut self, value: &str) -> i64 {
    if let Some(index) = self.lookup.get(value) {
      return *index;
    }

    let index = i64::try_from(self.strings.len()).unwrap_or(i64::MAX);
    self.strings.push(value.to_string());
    self.lookup.insert(value.to_string(), index);
    index
  }

  fn into_strings(self) -> Vec<String> {
    self.strings
  }

  fn new() -> Self {
    // Index zero must be the empty string.
    Self {
      lookup: HashMap::from([(String::new(), 0)]),
      strings: vec![String::new()],
    }
  }
}

/// Builds a pprof profile with one `space/bytes` sample per backtrace
/// group of the dump. The grand total and the type groups carry no stack
/// to attribute, so they contribute no samples; a backtrace group without
/// frames keeps its bytes through a synthetic `<unknown>` location.
///
/// Captured frames are raw instruction pointers; locations are
/// address-based and left for consumers to symbolize offline.
#[must_use]
pub fn build_pprof_profile(
  dump: &HeapDump,
  stack_table: &StackTable,
) -> Profile {
  let mut string_table = StringTable::new();

  let sample_type = ValueType {
    ty: string_table.intern("space"),
    unit: string_table.intern("bytes"),
  };

  let mut functions = Vec::new();
  let mut location_ids: HashMap<StackFrame, u64> = HashMap::new();
  let mut locations = Vec::new();
  let mut samples = Vec::new();
  let mut unknown_location: Option<u64> = None;

  for record in dump.records() {
    if record.kind != DumpRecordKind::Backtrace {
      continue;
    }

    let backtrace = record
      .backtrace_ref
      .and_then(|backtrace_ref| stack_table.resolve(backtrace_ref));

    let mut sample_location_ids = Vec::new();

    if let Some(backtrace) = backtrace {
      sample_location_ids.reserve(backtrace.len());

      for frame in backtrace.frames() {
        let location_id = *location_ids.entry(*frame).or_insert_with(|| {
          let id = locations.len() as u64 + 1;
          locations.push(Location {
            id,
            mapping_id: 0,
            address: *frame as u64,
            line: Vec::new(),
            is_folded: false,
          });
          id
        });
        sample_location_ids.push(location_id);
      }
    }

    if sample_location_ids.is_empty() {
      // Tools drop samples with no location; give stackless bytes a
      // synthetic frame so the bucket stays visible.
      let location_id = *unknown_location.get_or_insert_with(|| {
        let name = string_table.intern("<unknown>");
        let function_id = functions.len() as u64 + 1;
        functions.push(Function {
          id: function_id,
          name,
          system_name: name,
          filename: name,
          start_line: 0,
        });

        let id = locations.len() as u64 + 1;
        locations.push(Location {
          id,
          mapping_id: 0,
          address: 0,
          line: vec![Line { function_id, line: 0 }],
          is_folded: false,
        });
        id
      });
      sample_location_ids.push(location_id);
    }

    samples.push(Sample {
      location_id: sample_location_ids,
      value: vec![i64::try_from(record.size).unwrap_or(i64::MAX)],
      label: Vec::new(),
    });
  }

  Profile {
    sample_type: vec![sample_type],
    sample: samples,
    mapping: Vec::new(),
    location: locations,
    function: functions,
    string_table: string_table.into_strings(),
    drop_frames: 0,
    keep_frames: 0,
    time_nanos: 0,
    duration_nanos: 0,
    period_type: Some(ValueType { ty: 0, unit: 0 }),
    period: 1,
    comment: Vec::new(),
    default_sample_type: 0,
  }
}
