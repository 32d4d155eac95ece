//! Serialization of exported datasets.

use crate::error::{NonSpatialError, Result};
use crate::query::Record;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    #[default]
    Csv,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    /// Serialize every record in this format.
    pub fn encode(self, records: &[Record]) -> Result<String> {
        match self {
            ExportFormat::Json => Ok(serde_json::to_string(records)?),
            ExportFormat::Csv => encode_as_csv(records),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = NonSpatialError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(NonSpatialError::UnsupportedFormat {
                format: other.to_string(),
            }),
        }
    }
}

/// Encode records as CSV with a header row taken from the first record.
///
/// An empty record set encodes to an empty string, not a lone header.
pub fn encode_as_csv(records: &[Record]) -> Result<String> {
    let Some(first) = records.first() else {
        return Ok(String::new());
    };
    let header: Vec<&str> = first.keys().collect();

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(&header).map_err(csv_error)?;
    for record in records {
        let row: Vec<String> = header
            .iter()
            .map(|key| record.get(key).map(ToString::to_string).unwrap_or_default())
            .collect();
        writer.write_record(&row).map_err(csv_error)?;
    }

    let bytes = writer.into_inner().map_err(|e| csv_error(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
}

fn csv_error(e: impl Into<std::io::Error>) -> NonSpatialError {
    NonSpatialError::Io(e.into())
}
