//! Parquet snapshot of a flattened batch.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use qpsync_core::RowSet;
use serde::Serialize;
use qpsync_storage::sha256_hex;

pub const RESPONSES_FILE: &str = "responses.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub survey_id: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Every column is nullable Utf8; timestamps use their key rendering.
pub fn rowset_record_batch(set: &RowSet) -> Result<RecordBatch> {
    let columns = set.columns();
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|name| ArrowField::new(*name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));

    let materialized: Vec<Vec<Option<String>>> = set
        .rows
        .iter()
        .map(|row| set.cells(row).iter().map(|c| c.render()).collect())
        .collect();

    let arrays = (0..columns.len())
        .map(|idx| {
            let values = materialized
                .iter()
                .map(|row| row[idx].as_deref())
                .collect::<Vec<_>>();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect::<Vec<_>>();

    RecordBatch::try_new(schema, arrays).context("building responses record batch")
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

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Write `responses.parquet` + `manifest.json` into `out_dir`; returns the manifest path.
pub fn export_rowset(set: &RowSet, survey_id: &str, out_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let responses_path = out_dir.join(RESPONSES_FILE);
    let batch = rowset_record_batch(set)?;
    write_parquet(&responses_path, &batch)?;

    let manifest = ExportManifest {
        schema_version: 1,
        survey_id: survey_id.to_string(),
        rows: set.len(),
        columns: set.columns().into_iter().map(str::to_string).collect(),
        files: vec![manifest_entry("responses", out_dir, &responses_path)?],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use chrono::NaiveDateTime;
    use qpsync_core::FlatRow;
    use tempfile::tempdir;

    fn sample_set() -> RowSet {
        let ts = NaiveDateTime::parse_from_str("2024-01-05 15:15:00", "%Y-%m-%d %H:%M:%S").unwrap();
        RowSet {
            question_codes: vec!["Q1".into(), "Q2".into()],
            rows: vec![
                FlatRow {
                    key: "2024-01-05 15:15:00".into(),
                    response_id: Some("120001".into()),
                    submitted_at: ts,
                    answers: vec!["Red, Blue".into(), String::new()],
                },
                FlatRow {
                    key: "2024-01-05 15:16:00".into(),
                    response_id: None,
                    submitted_at: ts + chrono::Duration::minutes(1),
                    answers: vec![String::new(), "ok".into()],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn record_batch_mirrors_the_column_union() {
        let batch = rowset_record_batch(&sample_set()).expect("batch");
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 4);
        assert_eq!(batch.schema().field(2).name(), "Q1");

        let identity = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert_eq!(identity.value(0), "120001");
        assert!(identity.is_null(1));
        let submitted = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert_eq!(submitted.value(1), "2024-01-05 15:16:00");
        let q2 = batch
            .column(3)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert_eq!(q2.value(0), "");
        assert!(!q2.is_null(0));
    }

    #[test]
    fn export_writes_parquet_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let manifest_path = export_rowset(&sample_set(), "998877", dir.path()).expect("export");

        assert!(dir.path().join(RESPONSES_FILE).exists());
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("json");
        assert_eq!(manifest["rows"], 2);
        assert_eq!(manifest["survey_id"], "998877");
        assert_eq!(manifest["files"][0]["path"], RESPONSES_FILE);
        assert_eq!(manifest["files"][0]["sha256"].as_str().map(str::len), Some(64));
    }
}
