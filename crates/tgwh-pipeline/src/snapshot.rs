//! Detection snapshot: the parquet hand-off between Detect and Load.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tgwh_core::{DetectionRecord, ImageCategory};
use tgwh_storage::sha256_hex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

fn snapshot_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("message_id", DataType::Int64, false),
        ArrowField::new("channel_name", DataType::Utf8, false),
        ArrowField::new("image_path", DataType::Utf8, false),
        ArrowField::new("detected_class_set", DataType::Utf8, false),
        ArrowField::new("best_confidence", DataType::Float64, false),
        ArrowField::new("image_category", DataType::Utf8, false),
    ]))
}

/// Replace the snapshot at `path` with `records`. Zero records still produce
/// a valid (empty) file, so Load can tell "nothing detected" from "never ran".
pub fn write_detection_snapshot(path: &Path, records: &[DetectionRecord]) -> Result<SnapshotInfo> {
    let class_sets = records
        .iter()
        .map(|r| serde_json::to_string(&r.detected_class_set))
        .collect::<Result<Vec<_>, _>>()
        .context("encoding detected class sets")?;

    let batch = RecordBatch::try_new(
        snapshot_schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.message_id))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.channel_name.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.image_path.as_str()))),
            Arc::new(StringArray::from_iter_values(class_sets.iter())),
            Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.best_confidence))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.image_category.as_str()))),
        ],
    )
    .context("building detection record batch")?;

    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let temp_path = parent.join(format!(".detections.{}.tmp", Uuid::new_v4()));

    let written = write_parquet(&temp_path, &batch).and_then(|()| {
        fs::rename(&temp_path, path)
            .with_context(|| format!("renaming {} to {}", temp_path.display(), path.display()))
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    let bytes = fs::read(path).with_context(|| format!("reading back {}", path.display()))?;
    Ok(SnapshotInfo {
        path: path.to_path_buf(),
        rows: records.len(),
        sha256: sha256_hex(&bytes),
    })
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// `Ok(None)` when no snapshot exists yet.
pub fn read_detection_snapshot(path: &Path) -> Result<Option<Vec<DetectionRecord>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
    };
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        decode_batch(&batch, &mut records)
            .with_context(|| format!("decoding {}", path.display()))?;
    }
    Ok(Some(records))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("column {name} has unexpected type"))
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<DetectionRecord>) -> Result<()> {
    let message_ids = column::<Int64Array>(batch, "message_id")?;
    let channels = column::<StringArray>(batch, "channel_name")?;
    let paths = column::<StringArray>(batch, "image_path")?;
    let class_sets = column::<StringArray>(batch, "detected_class_set")?;
    let confidences = column::<Float64Array>(batch, "best_confidence")?;
    let categories = column::<StringArray>(batch, "image_category")?;

    for row in 0..batch.num_rows() {
        if message_ids.is_null(row) {
            return Err(anyhow!("row {row} has no message_id"));
        }
        let detected_class_set: Vec<u32> = serde_json::from_str(class_sets.value(row))
            .with_context(|| format!("row {row} detected_class_set"))?;
        let image_category: ImageCategory = categories.value(row).parse()?;
        out.push(DetectionRecord {
            message_id: message_ids.value(row),
            channel_name: channels.value(row).to_string(),
            image_path: paths.value(row).to_string(),
            detected_class_set,
            best_confidence: confidences.value(row),
            image_category,
        });
    }
    Ok(())
}
