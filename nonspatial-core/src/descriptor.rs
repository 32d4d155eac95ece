//! Tabular Data Resource descriptors.
//!
//! A descriptor declares a dataset's metadata, its column schema and the CSV
//! dialect of its data file. The same shape arrives either as a JSON file
//! inside an uploaded archive or inline in a registration request.

use crate::error::IngestError;
use crate::schema::Column;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_DELIMITER: char = ';';
pub const DEFAULT_QUOTE_CHAR: char = '"';

const REQUIRED_KEYS: [&str; 3] = ["name", "title", "schema"];

/// `schema.primaryKey` is either a single field name or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl Default for PrimaryKey {
    fn default() -> Self {
        PrimaryKey::Composite(Vec::new())
    }
}

impl PrimaryKey {
    pub fn names(&self) -> Vec<&str> {
        match self {
            PrimaryKey::Single(name) => vec![name.as_str()],
            PrimaryKey::Composite(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<Column>,
    #[serde(rename = "primaryKey", default)]
    pub primary_key: PrimaryKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CsvDialect {
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub quotechar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularDataResource {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub schema: TableSchema,
    #[serde(default)]
    pub dialect: Option<CsvDialect>,
}

impl TabularDataResource {
    /// Parse a descriptor, requiring the `name`, `title` and `schema` keys.
    pub fn from_value(value: Value) -> Result<Self, IngestError> {
        let Some(object) = value.as_object() else {
            return Err(IngestError::malformed(
                "Tabular Data Resource description must be a JSON object",
            ));
        };
        if REQUIRED_KEYS.iter().any(|key| !object.contains_key(*key)) {
            return Err(IngestError::malformed(
                "Unexpected Tabular Data Resource JSON description",
            ));
        }
        serde_json::from_value(value).map_err(|e| {
            IngestError::malformed(format!("Invalid Tabular Data Resource description: {e}"))
        })
    }

    /// The dataset abstract; empty when no description was given.
    pub fn abstract_text(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }

    /// Column definitions in declared order, with primary key flags applied.
    pub fn columns(&self) -> Vec<Column> {
        let mut columns = self.schema.fields.clone();
        for pk in self.schema.primary_key.names() {
            match columns.iter_mut().find(|c| c.name == pk) {
                Some(column) => column.primary_key = true,
                None => {
                    tracing::warn!(
                        dataset = %self.name,
                        primary_key = %pk,
                        "Primary key names no declared field"
                    );
                }
            }
        }
        columns
    }

    /// Resolve the CSV delimiter and quote character as single bytes.
    pub fn csv_dialect(
        &self,
        default_delimiter: char,
        default_quote_char: char,
    ) -> Result<(u8, u8), IngestError> {
        let dialect = self.dialect.clone().unwrap_or_default();
        let delimiter = single_byte(
            "delimiter",
            dialect.delimiter.as_deref(),
            default_delimiter,
        )?;
        let quote = single_byte(
            "quotechar",
            dialect.quotechar.as_deref(),
            default_quote_char,
        )?;
        Ok((delimiter, quote))
    }
}

fn single_byte(key: &str, declared: Option<&str>, default: char) -> Result<u8, IngestError> {
    let mut buf = [0u8; 4];
    let raw = declared.unwrap_or_else(|| default.encode_utf8(&mut buf));
    match raw.as_bytes() {
        [b] => Ok(*b),
        _ => Err(IngestError::malformed(format!(
            "CSV dialect {key} must be a single ASCII character, got {raw:?}"
        ))),
    }
}
