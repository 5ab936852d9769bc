use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, BooleanBuilder, StringBuilder, UInt32Builder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::{basic::Compression, file::properties::WriterProperties};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    common::{ensure_parent_dir, promote_tmp, tmp_path_for},
    model::FlatRecord,
};

/// Buffered Parquet writer for flattened hierarchy records.
///
/// Rows go to a `.tmp` sibling first and only replace the output on `finish`.
pub struct FlatRecordParquetWriter {
    output_path: PathBuf,
    tmp_path: PathBuf,
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,
    columns: Columns,
    rows_in_batch: usize,
    batch_size: usize,
}

#[derive(Default)]
struct Columns {
    code: StringBuilder,
    name: StringBuilder,
    status: StringBuilder,
    depth: UInt32Builder,
    parent_code: StringBuilder,
    parent_name: StringBuilder,
    path: StringBuilder,
    is_leaf: BooleanBuilder,
    child_count: UInt32Builder,
    includes: StringBuilder,
    excludes: StringBuilder,
    error: StringBuilder,
}

impl Columns {
    fn push(&mut self, record: &FlatRecord) {
        self.code.append_value(&record.code);
        self.name.append_value(&record.name);
        self.status.append_value(record.status.as_str());
        self.depth.append_value(record.depth as u32);
        self.parent_code.append_option(record.parent_code.as_deref());
        self.parent_name.append_option(record.parent_name.as_deref());
        self.path.append_value(record.path_display());
        self.is_leaf.append_value(record.is_leaf);
        self.child_count.append_value(record.child_count as u32);
        self.includes.append_option(record.includes.as_deref());
        self.excludes.append_option(record.excludes.as_deref());
        self.error.append_option(record.error.as_deref());
    }

    fn finish(&mut self) -> Vec<ArrayRef> {
        vec![
            Arc::new(self.code.finish()),
            Arc::new(self.name.finish()),
            Arc::new(self.status.finish()),
            Arc::new(self.depth.finish()),
            Arc::new(self.parent_code.finish()),
            Arc::new(self.parent_name.finish()),
            Arc::new(self.path.finish()),
            Arc::new(self.is_leaf.finish()),
            Arc::new(self.child_count.finish()),
            Arc::new(self.includes.finish()),
            Arc::new(self.excludes.finish()),
            Arc::new(self.error.finish()),
        ]
    }
}

fn flat_record_schema() -> Schema {
    Schema::new(vec![
        Field::new("code", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("depth", DataType::UInt32, false),
        Field::new("parent_code", DataType::Utf8, true),
        Field::new("parent_name", DataType::Utf8, true),
        Field::new("path", DataType::Utf8, false),
        Field::new("is_leaf", DataType::Boolean, false),
        Field::new("child_count", DataType::UInt32, false),
        Field::new("includes", DataType::Utf8, true),
        Field::new("excludes", DataType::Utf8, true),
        Field::new("error", DataType::Utf8, true),
    ])
}

impl FlatRecordParquetWriter {
    pub fn try_new(output_path: &Path, batch_size: usize) -> Result<Self> {
        ensure_parent_dir(output_path)?;
        let tmp_path = tmp_path_for(output_path, "codes.parquet");
        let schema = Arc::new(flat_record_schema());

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
            .context("Failed creating Parquet ArrowWriter")?;

        Ok(Self {
            output_path: output_path.to_path_buf(),
            tmp_path,
            schema,
            writer,
            columns: Columns::default(),
            rows_in_batch: 0,
            batch_size: batch_size.max(1),
        })
    }

    pub fn push(&mut self, record: &FlatRecord) -> Result<()> {
        self.columns.push(record);
        self.rows_in_batch += 1;
        if self.rows_in_batch >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.flush_batch()?;
        self.writer
            .close()
            .context("Failed closing Parquet writer")?;
        promote_tmp(&self.tmp_path, &self.output_path)
    }

    pub fn abort(self) {
        // Leave any previous output untouched.
        let _ = self.writer.close();
        let _ = fs::remove_file(&self.tmp_path);
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.rows_in_batch == 0 {
            return Ok(());
        }
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), self.columns.finish())
            .context("Failed creating RecordBatch for Parquet write")?;
        self.writer
            .write(&batch)
            .context("Failed writing Parquet RecordBatch")?;
        self.rows_in_batch = 0;
        Ok(())
    }
}

pub fn write_records_parquet(records: &[FlatRecord], output_path: &Path) -> Result<()> {
    let mut writer = FlatRecordParquetWriter::try_new(output_path, 4096)?;
    for record in records {
        if let Err(err) = writer.push(record) {
            writer.abort();
            return Err(err);
        }
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flatten::extract_all_codes, model::CodeNode};
    use parquet::file::reader::{FileReader, SerializedFileReader};

    #[test]
    fn writes_one_row_per_record_across_batches() {
        let mut root = CodeNode::new("F32");
        root.children = (0..5)
            .map(|i| CodeNode::new(format!("F32.{i}")))
            .collect();
        let records = extract_all_codes(&root);

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("codes.parquet");
        let mut writer = FlatRecordParquetWriter::try_new(&out, 2).unwrap();
        for record in &records {
            writer.push(record).unwrap();
        }
        writer.finish().unwrap();

        assert!(!tmp_path_for(&out, "codes.parquet").exists());
        let reader = SerializedFileReader::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 6);
        assert_eq!(
            reader.metadata().file_metadata().schema_descr().num_columns(),
            FlatRecord::COLUMNS.len()
        );
    }

    #[test]
    fn abort_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("codes.parquet");
        let writer = FlatRecordParquetWriter::try_new(&out, 10).unwrap();
        writer.abort();
        assert!(!out.exists());
        assert!(!tmp_path_for(&out, "codes.parquet").exists());
    }
}
