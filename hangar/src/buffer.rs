//! Chunked table buffer
//!
//! A dataset built incrementally from record batches sharing one schema.
//! Row and byte accounting are updated per append. The byte size is the
//! exact length of the Arrow IPC stream an end-to-end write of the buffer
//! would produce, obtained by pushing every message through a counting sink
//! that drops the bytes.

use std::io::{self, Write};
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::writer::{write_message, DictionaryTracker, IpcDataGenerator, IpcWriteOptions};
use arrow::record_batch::RecordBatch;

use crate::{HangarError, Result};

/// Continuation marker plus zero length, written by `StreamWriter::finish`
const END_OF_STREAM_LEN: usize = 8;

/// `io::Write` sink that keeps only the number of bytes written
#[derive(Debug, Default)]
struct CountingSink {
    written: usize,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Mirrors the IPC stream writer's message sequence without keeping output.
struct IpcSizer {
    data_gen: IpcDataGenerator,
    dictionaries: DictionaryTracker,
    options: IpcWriteOptions,
    sink: CountingSink,
}

impl IpcSizer {
    fn new(schema: &Schema) -> Result<Self> {
        let mut sizer = Self {
            data_gen: IpcDataGenerator::default(),
            dictionaries: DictionaryTracker::new(false),
            options: IpcWriteOptions::default(),
            sink: CountingSink::default(),
        };
        let encoded = sizer.data_gen.schema_to_bytes_with_dictionary_tracker(
            schema,
            &mut sizer.dictionaries,
            &sizer.options,
        );
        write_message(&mut sizer.sink, encoded, &sizer.options)?;
        Ok(sizer)
    }

    /// Count one batch (and any dictionaries it introduces); returns bytes added
    fn add(&mut self, batch: &RecordBatch) -> Result<usize> {
        let before = self.sink.written;
        let (dictionaries, message) =
            self.data_gen
                .encoded_batch(batch, &mut self.dictionaries, &self.options)?;
        for dictionary in dictionaries {
            write_message(&mut self.sink, dictionary, &self.options)?;
        }
        write_message(&mut self.sink, message, &self.options)?;
        Ok(self.sink.written - before)
    }

    fn stream_len(&self) -> usize {
        self.sink.written + END_OF_STREAM_LEN
    }
}

/// Structural schema equality: same arity and, per position, same field
/// name, data type and nullability. Metadata is ignored.
pub fn schemas_match(expected: &Schema, actual: &Schema) -> bool {
    expected.fields().len() == actual.fields().len()
        && expected
            .fields()
            .iter()
            .zip(actual.fields().iter())
            .all(|(a, b)| {
                a.name() == b.name()
                    && a.data_type() == b.data_type()
                    && a.is_nullable() == b.is_nullable()
            })
}

fn describe_mismatch(expected: &Schema, actual: &Schema) -> String {
    if expected.fields().len() != actual.fields().len() {
        return format!(
            "expected {} fields, got {}",
            expected.fields().len(),
            actual.fields().len()
        );
    }
    for (i, (a, b)) in expected.fields().iter().zip(actual.fields().iter()).enumerate() {
        if a.name() != b.name() || a.data_type() != b.data_type() || a.is_nullable() != b.is_nullable()
        {
            return format!(
                "field {}: expected {} {}{}, got {} {}{}",
                i,
                a.name(),
                a.data_type(),
                if a.is_nullable() { "" } else { " not null" },
                b.name(),
                b.data_type(),
                if b.is_nullable() { "" } else { " not null" },
            );
        }
    }
    "schemas differ".to_string()
}

/// Point-in-time listing entry for a stored table
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub schema: SchemaRef,
    pub num_rows: usize,
    pub num_batches: usize,
    pub byte_size: usize,
}

/// Read-only view of a buffer's batches at the time it was taken
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    schema: SchemaRef,
    batches: Arc<[RecordBatch]>,
    num_rows: usize,
    byte_size: usize,
}

impl TableSnapshot {
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Concatenate all batches into one, preserving order
    pub fn concat(&self) -> Result<RecordBatch> {
        Ok(concat_batches(&self.schema, self.batches.iter())?)
    }
}

/// Append-only columnar dataset
pub struct ChunkedTable {
    schema: Option<SchemaRef>,
    batches: Vec<RecordBatch>,
    num_rows: usize,
    sizer: Option<IpcSizer>,
}

impl ChunkedTable {
    /// Empty buffer; the schema is fixed by the first batch or declaration
    pub fn new() -> Self {
        Self {
            schema: None,
            batches: Vec::new(),
            num_rows: 0,
            sizer: None,
        }
    }

    pub fn with_schema(schema: SchemaRef) -> Result<Self> {
        let mut table = Self::new();
        table.declare_schema(schema)?;
        Ok(table)
    }

    /// Fix the schema, or confirm it matches the one already fixed.
    pub fn declare_schema(&mut self, schema: SchemaRef) -> Result<()> {
        match &self.schema {
            Some(existing) => {
                if !schemas_match(existing, &schema) {
                    return Err(HangarError::SchemaMismatch(describe_mismatch(
                        existing, &schema,
                    )));
                }
            }
            None => {
                self.sizer = Some(IpcSizer::new(&schema)?);
                self.schema = Some(schema);
            }
        }
        Ok(())
    }

    /// Append a batch. O(batch): only the new batch is encoded for sizing.
    pub fn append(&mut self, batch: RecordBatch) -> Result<()> {
        self.declare_schema(batch.schema())?;
        if let Some(sizer) = self.sizer.as_mut() {
            sizer.add(&batch)?;
        }
        self.num_rows += batch.num_rows();
        self.batches.push(batch);
        Ok(())
    }

    pub fn schema(&self) -> Option<SchemaRef> {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    /// Serialized IPC stream size; 0 while no schema is fixed
    pub fn byte_size(&self) -> usize {
        self.sizer.as_ref().map(IpcSizer::stream_len).unwrap_or(0)
    }

    pub fn summary(&self) -> TableSummary {
        TableSummary {
            schema: self.schema_or_empty(),
            num_rows: self.num_rows,
            num_batches: self.batches.len(),
            byte_size: self.byte_size(),
        }
    }

    pub fn materialize(&self) -> TableSnapshot {
        TableSnapshot {
            schema: self.schema_or_empty(),
            batches: self.batches.clone().into(),
            num_rows: self.num_rows,
            byte_size: self.byte_size(),
        }
    }

    fn schema_or_empty(&self) -> SchemaRef {
        self.schema
            .clone()
            .unwrap_or_else(|| Arc::new(Schema::empty()))
    }
}

impl Default for ChunkedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTable")
            .field("schema", &self.schema)
            .field("num_batches", &self.batches.len())
            .field("num_rows", &self.num_rows)
            .field("byte_size", &self.byte_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use arrow::ipc::writer::StreamWriter;

    fn character_batch(names: &[&str]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "Character",
            DataType::Utf8,
            true,
        )]));
        RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(names.to_vec()))]).unwrap()
    }

    fn number_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn stream_len(schema: &Schema, batches: &[RecordBatch]) -> usize {
        let mut buf = Vec::new();
        let mut writer = StreamWriter::try_new(&mut buf, schema).unwrap();
        for batch in batches {
            writer.write(batch).unwrap();
        }
        writer.finish().unwrap();
        drop(writer);
        buf.len()
    }

    #[test]
    fn test_append_accumulates_rows() {
        let mut table = ChunkedTable::new();
        assert_eq!(table.byte_size(), 0);

        let mut last_size = 0;
        for n in 1..=4 {
            table.append(number_batch((0..n * 10).collect())).unwrap();
            assert!(table.byte_size() >= last_size);
            last_size = table.byte_size();
        }

        assert_eq!(table.num_batches(), 4);
        assert_eq!(table.num_rows(), 10 + 20 + 30 + 40);
    }

    #[test]
    fn test_byte_size_matches_stream_writer() {
        let mut table = ChunkedTable::new();
        table.append(character_batch(&["Mario", "Luigi"])).unwrap();
        table.append(character_batch(&["Peach"])).unwrap();

        let snapshot = table.materialize();
        assert_eq!(
            table.byte_size(),
            stream_len(&snapshot.schema(), snapshot.batches())
        );
    }

    #[test]
    fn test_declared_schema_counts_without_batches() {
        let schema = character_batch(&[]).schema();
        let table = ChunkedTable::with_schema(schema.clone()).unwrap();
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.byte_size(), stream_len(&schema, &[]));
    }

    #[test]
    fn test_schema_mismatch_leaves_buffer_untouched() {
        let mut table = ChunkedTable::new();
        table.append(character_batch(&["Mario"])).unwrap();
        let size = table.byte_size();

        let err = table.append(number_batch(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, HangarError::SchemaMismatch(_)));
        assert_eq!(table.num_rows(), 1);
        assert_eq!(table.num_batches(), 1);
        assert_eq!(table.byte_size(), size);
    }

    #[test]
    fn test_nullability_is_part_of_schema() {
        let nullable = Schema::new(vec![Field::new("n", DataType::Int64, true)]);
        let required = Schema::new(vec![Field::new("n", DataType::Int64, false)]);
        assert!(!schemas_match(&nullable, &required));
        assert!(schemas_match(
            &nullable,
            &nullable.clone().with_metadata([("k".to_string(), "v".to_string())].into())
        ));
    }

    #[test]
    fn test_materialize_is_a_stable_snapshot() {
        let mut table = ChunkedTable::new();
        table.append(character_batch(&["Mario", "Luigi"])).unwrap();
        let snapshot = table.materialize();

        table.append(character_batch(&["Peach"])).unwrap();
        assert_eq!(snapshot.num_rows(), 2);
        assert_eq!(table.num_rows(), 3);

        let all = table.materialize().concat().unwrap();
        let names = all
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.value(0), "Mario");
        assert_eq!(names.value(2), "Peach");
    }
}
