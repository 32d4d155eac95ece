//! Archive ingestion.
//!
//! An uploaded zip archive carries exactly one CSV data file and one
//! Tabular Data Resource JSON description. Ingestion extracts it into a
//! scratch directory, provisions a dataset table from the description and
//! loads the CSV rows into it.

use crate::catalog::Catalog;
use crate::config::IngestConfig;
use crate::descriptor::TabularDataResource;
use crate::error::{IngestError, Result};
use crate::schema::Column;
use crate::storage::{Backend, Binder};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Outcome of an ingestion or registration, handed to whoever persists the
/// higher-level dataset resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionParameters {
    pub dataset_id: i64,
    pub dataset_title: String,
    pub dataset_name: String,
    pub dataset_abstract: String,
    pub column_definitions: Vec<Column>,
    pub dataset_table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres_url: Option<String>,
}

/// Guess a MIME type from a file name's extension.
pub fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "zip" => ZIP_CONTENT_TYPE,
        "csv" => "text/csv",
        "json" => "application/json",
        "txt" => "text/plain",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "xml" => "application/xml",
        _ => return None,
    };
    Some(content_type)
}

/// Unpack a zip archive into `dest`, returning the number of files written.
///
/// Entries whose names would escape `dest` are skipped. At most `max_bytes`
/// are written in total; sizes declared in entry headers are checked against
/// that budget but never trusted for allocation.
pub fn extract_archive(archive: &Path, dest: &Path, max_bytes: u64) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| IngestError::malformed(format!("Invalid zip archive: {e}")))?;

    let mut extracted = 0;
    let mut remaining = max_bytes;
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| IngestError::malformed(format!("Unreadable zip entry {i}: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = %entry.name(), "Skipping zip entry outside extraction dir");
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if entry.size() > remaining {
            return Err(extraction_limit(max_bytes));
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&out_path)?;
        // One byte over the budget is enough to tell an overrun apart.
        let written = std::io::copy(&mut entry.take(remaining + 1), &mut out)?;
        if written > remaining {
            return Err(extraction_limit(max_bytes));
        }
        remaining -= written;
        extracted += 1;
    }
    Ok(extracted)
}

fn extraction_limit(max_bytes: u64) -> crate::error::NonSpatialError {
    IngestError::malformed(format!(
        "Archive expands beyond the {max_bytes} byte extraction limit"
    ))
    .into()
}

/// Find the single `.csv` and single `.json` file at the top of `dir`.
pub fn verify_archive_contents(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let mut csv_files = Vec::new();
    let mut json_files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".csv") {
            csv_files.push(path);
        } else if name.ends_with(".json") {
            json_files.push(path);
        }
    }

    let csv_file = match csv_files.len() {
        0 => return Err(IngestError::malformed("No CSV file provided").into()),
        1 => csv_files.remove(0),
        n => {
            return Err(IngestError::malformed(format!(
                "Expected exactly one CSV file, found {n}"
            ))
            .into());
        }
    };
    let json_file = match json_files.len() {
        0 => {
            return Err(IngestError::malformed(
                "No JSON file for describing the CSV structure provided",
            )
            .into());
        }
        1 => json_files.remove(0),
        n => {
            return Err(IngestError::malformed(format!(
                "Expected exactly one JSON file, found {n}"
            ))
            .into());
        }
    };
    Ok((csv_file, json_file))
}

/// Read and validate a Tabular Data Resource description file.
pub fn load_tabular_data_resource(path: &Path) -> Result<TabularDataResource> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| IngestError::malformed(format!("Invalid JSON description: {e}")))?;
    Ok(TabularDataResource::from_value(value)?)
}

/// Parse every data row of a CSV file; the header row is skipped.
pub fn read_csv_rows(path: &Path, delimiter: u8, quote: u8) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(quote)
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| IngestError::malformed(format!("Unreadable CSV file: {e}")))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| IngestError::malformed(format!("Invalid CSV data: {e}")))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Insert rows one statement at a time, returning how many were inserted.
///
/// A value that cannot be converted for its column, or that lies beyond the
/// last column, is logged and left out of the statement; the column list is
/// explicit, so it ends up NULL without shifting the values after it.
pub async fn insert_rows(
    backend: &dyn Backend,
    table: &str,
    columns: &[Column],
    rows: &[Vec<String>],
) -> Result<usize> {
    let mut inserted = 0;
    for (row_index, row) in rows.iter().enumerate() {
        let mut binder = Binder::new(backend.dialect());
        let mut names = Vec::with_capacity(row.len());
        let mut values = Vec::with_capacity(row.len());

        for (i, raw) in row.iter().enumerate() {
            let Some(column) = columns.get(i) else {
                tracing::warn!(table, row = row_index, position = i, "Value beyond last column skipped");
                continue;
            };
            match column.to_sql_value(raw) {
                Ok(value) => {
                    names.push(column.sql_name());
                    values.push(binder.bind(value));
                }
                Err(e) => {
                    tracing::warn!(table, row = row_index, error = %e, "Value skipped");
                }
            }
        }

        if names.is_empty() {
            tracing::warn!(table, row = row_index, "Row without usable values skipped");
            continue;
        }

        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            values.join(", ")
        );
        backend.execute(&sql, &binder.into_params()).await?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Drives archive ingestion against the catalog's database.
#[derive(Debug, Clone)]
pub struct ArchiveIngestor {
    catalog: Arc<Catalog>,
    upload_dir: PathBuf,
    default_delimiter: char,
    default_quote_char: char,
    max_extracted_bytes: u64,
}

impl ArchiveIngestor {
    pub fn new(catalog: Arc<Catalog>, config: &IngestConfig) -> Self {
        Self {
            catalog,
            upload_dir: config.resolved_upload_dir(),
            default_delimiter: config.default_delimiter,
            default_quote_char: config.default_quote_char,
            max_extracted_bytes: config.max_extracted_bytes,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Persist uploaded bytes under the upload directory.
    ///
    /// The stored name keeps the original extension so the content type can
    /// be guessed from it later.
    pub async fn store_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let base = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload");
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let path = self
            .upload_dir
            .join(format!("{}-{base}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Upload stored");
        Ok(path)
    }

    /// Ingest a zip archive holding one CSV file and its description.
    ///
    /// The extraction directory is removed whatever the outcome; the
    /// archive itself is removed only after a successful ingestion.
    pub async fn ingest_zipped_dataset(
        &self,
        archive: &Path,
        declared_content_type: Option<&str>,
    ) -> Result<IngestionParameters> {
        let content_type = guess_content_type(archive)
            .or(declared_content_type)
            .unwrap_or("application/octet-stream");
        if content_type != ZIP_CONTENT_TYPE {
            return Err(IngestError::UnsupportedFileType {
                content_type: content_type.to_string(),
            }
            .into());
        }

        tracing::info!(archive = %archive.display(), "Ingesting dataset archive");
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("nonspatial-{}", uuid::Uuid::new_v4()))
            .rand_bytes(0)
            .tempdir_in(&self.upload_dir)?;

        let params = self.ingest_extracted(archive, scratch.path()).await?;
        drop(scratch);

        if let Err(e) = tokio::fs::remove_file(archive).await {
            tracing::warn!(archive = %archive.display(), error = %e, "Failed to remove ingested archive");
        }
        Ok(params)
    }

    async fn ingest_extracted(&self, archive: &Path, dir: &Path) -> Result<IngestionParameters> {
        let (archive_path, dir_path) = (archive.to_path_buf(), dir.to_path_buf());
        let max_bytes = self.max_extracted_bytes;
        let files =
            tokio::task::spawn_blocking(move || extract_archive(&archive_path, &dir_path, max_bytes))
                .await
                .map_err(std::io::Error::other)??;
        tracing::debug!(files, dir = %dir.display(), "Archive extracted");

        let (csv_file, json_file) = verify_archive_contents(dir)?;
        let tdr = load_tabular_data_resource(&json_file)?;
        let columns = tdr.columns();
        let (delimiter, quote) = tdr.csv_dialect(self.default_delimiter, self.default_quote_char)?;

        let rows = tokio::task::spawn_blocking(move || read_csv_rows(&csv_file, delimiter, quote))
            .await
            .map_err(std::io::Error::other)??;

        let (dataset_id, table) = self
            .catalog
            .provision_dataset_table(&tdr.title, &columns)
            .await?;
        let inserted = insert_rows(self.catalog.backend().as_ref(), &table, &columns, &rows).await?;
        tracing::info!(dataset_id, table = %table, rows = inserted, "Dataset ingested");

        Ok(IngestionParameters {
            dataset_id,
            dataset_title: tdr.title.clone(),
            dataset_name: tdr.name.clone(),
            dataset_abstract: tdr.abstract_text().to_string(),
            column_definitions: columns,
            dataset_table: table,
            postgres_url: None,
        })
    }
}
