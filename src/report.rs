use super::*;

/// Errors that can occur while exporting a heap dump.
#[derive(Debug)]
pub enum ExportError {
  Encode(prost::EncodeError),
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Encode(err) => {
        write!(f, "failed to encode heap dump as pprof: {err}")
      }
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode heap dump as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Encode(err) => Some(err),
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

impl From<prost::EncodeError> for ExportError {
  fn from(value: prost::EncodeError) -> Self {
    Self::Encode(value)
  }
}

/// Formats a byte count as the fixed-width hexadecimal string the dump
/// format requires: sixteen lowercase hex digits, zero padded.
#[must_use]
pub fn format_size(size: u64) -> String {
  format!("{size:016x}")
}

/// Which grouping a [`DumpRecord`] describes.
///
/// Carried out of band: the wire contract distinguishes records only by
/// which keys are present, which leaves the grand total, the
/// empty-backtrace group and the unknown-type group identical on the
/// wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DumpRecordKind {
  Backtrace,
  Total,
  Type,
}

/// One record of a heap dump: the grand total, a per-backtrace total, or a
/// per-type total.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DumpRecord {
  /// Interned backtrace the bytes are attributed to; `None` for the empty
  /// backtrace and for records that do not group by backtrace.
  pub backtrace_ref: Option<BacktraceId>,
  /// Grouping this record describes; never serialized.
  pub kind: DumpRecordKind,
  /// Live bytes attributed to this record's group.
  pub size: u64,
  /// Type tag the bytes are attributed to; `None` for the unknown tag and
  /// for records that do not group by type.
  pub type_tag: Option<TypeTag>,
}

impl DumpRecord {
  #[must_use]
  pub fn backtrace_group(
    backtrace_ref: Option<BacktraceId>,
    size: u64,
  ) -> Self {
    Self {
      backtrace_ref,
      kind: DumpRecordKind::Backtrace,
      size,
      type_tag: None,
    }
  }

  #[must_use]
  pub fn total(size: u64) -> Self {
    Self {
      backtrace_ref: None,
      kind: DumpRecordKind::Total,
      size,
      type_tag: None,
    }
  }

  #[must_use]
  pub fn type_group(type_tag: Option<TypeTag>, size: u64) -> Self {
    Self {
      backtrace_ref: None,
      kind: DumpRecordKind::Type,
      size,
      type_tag,
    }
  }
}

impl Serialize for DumpRecord {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("DumpRecord", 3)?;

    if let Some(backtrace_ref) = self.backtrace_ref {
      state.serialize_field("bt", &backtrace_ref.to_string())?;
    }

    if let Some(type_tag) = self.type_tag {
      state.serialize_field("type", &type_tag.to_string())?;
    }

    state.serialize_field("size", &format_size(self.size))?;
    state.end()
  }
}

/// Grouped heap-dump report: an ordered record sequence whose first record
/// carries the grand total. Serializes as a JSON array in emission order.
#[derive(Debug, Clone, Default)]
pub struct HeapDump {
  records: Vec<DumpRecord>,
}

impl Serialize for HeapDump {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.collect_seq(&self.records)
  }
}

impl HeapDump {
  /// Writes the dump as a JSON array of records, in emission order.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization fails or the writer rejects the
  /// output.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), ExportError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  /// Writes the dump as a gzip-free binary pprof profile, resolving
  /// backtrace references through `stack_table`.
  ///
  /// # Errors
  ///
  /// Returns an error if protobuf encoding fails or the writer rejects the
  /// output.
  pub fn export_pprof<W: Write>(
    &self,
    stack_table: &StackTable,
    mut writer: W,
  ) -> Result<(), ExportError> {
    let profile = build_pprof_profile(self, stack_table);

    let mut buffer = Vec::with_capacity(4096);
    profile.encode(&mut buffer)?;
    writer.write_all(&buffer)?;

    Ok(())
  }

  #[must_use]
  pub(crate) fn new(records: Vec<DumpRecord>) -> Self {
    Self { records }
  }

  #[must_use]
  pub fn records(&self) -> &[DumpRecord] {
    &self.records
  }

  /// Streams every record, in order, into the provided sink.
  ///
  /// # Errors
  ///
  /// Returns the first error the sink reports.
  pub fn stream_into<S: DumpSink>(
    &self,
    sink: &mut S,
  ) -> Result<(), ExportError> {
    for record in &self.records {
      sink.write_record(record)?;
    }
    Ok(())
  }

  /// Total live bytes across all groups (the first record's size).
  #[must_use]
  pub fn total_size(&self) -> u64 {
    self.records.first().map_or(0, |record| record.size)
  }
}

/// Streaming interface for heap-dump consumers.
pub trait DumpSink {
  /// Receives one record; records arrive in the dump's emission order.
  ///
  /// # Errors
  ///
  /// Returns an `ExportError` if the record cannot be serialized or the
  /// underlying writer fails to persist it.
  fn write_record(&mut self, record: &DumpRecord) -> Result<(), ExportError>;
}

/// Sink that writes one JSON object per line.
pub struct JsonLinesSink<W: Write> {
  writer: W,
}

impl<W: Write> DumpSink for JsonLinesSink<W> {
  fn write_record(&mut self, record: &DumpRecord) -> Result<(), ExportError> {
    serde_json::to_writer(&mut self.writer, record)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

impl<W: Write> JsonLinesSink<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}
