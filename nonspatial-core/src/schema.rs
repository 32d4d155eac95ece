//! Column definitions and their translation into SQL.
//!
//! The logical type vocabulary is closed: `integer`, `number` and `string`.
//! Everything here is pure so it can be tested without a database.

use crate::decimal::DecimalLiteral;
use crate::error::SchemaError;
use crate::storage::SqlValue;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Maximum length of `string` columns, in characters.
pub const MAX_STRING_FIELD_LENGTH: usize = 256;

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Number,
    String,
}

impl ColumnType {
    /// The SQL type used when creating a dataset table.
    pub fn sql_type(self) -> String {
        match self {
            ColumnType::Integer => "INT".to_string(),
            ColumnType::Number => "NUMERIC".to_string(),
            ColumnType::String => format!("VARCHAR({MAX_STRING_FIELD_LENGTH})"),
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Number)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Number => "number",
            ColumnType::String => "string",
        }
    }
}

impl FromStr for ColumnType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(ColumnType::Integer),
            "number" => Ok(ColumnType::Number),
            "string" => Ok(ColumnType::String),
            other => Err(SchemaError::UnsupportedType {
                type_name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a logical type name onto its SQL type.
pub fn sql_type_for(logical_type: &str) -> Result<String, SchemaError> {
    Ok(logical_type.parse::<ColumnType>()?.sql_type())
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One column of a dataset, as declared in a Tabular Data Resource field.
///
/// The type is kept as the declared string: remote datasets are cataloged
/// without a table being created, so unknown types can legitimately be
/// stored and are only rejected when a table is built from them. Any other
/// keys of the field descriptor are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "primaryKey", default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            type_name: column_type.as_str().to_string(),
            primary_key: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn column_type(&self) -> Result<ColumnType, SchemaError> {
        self.type_name.parse()
    }

    /// Whether values are rendered as numbers; unknown types count as text.
    pub fn is_numeric(&self) -> bool {
        self.column_type().map(ColumnType::is_numeric).unwrap_or(false)
    }

    /// The identifier used for this column in SQL.
    pub fn sql_name(&self) -> String {
        sanitize(&self.name)
    }

    /// Convert a raw text cell into a bound value for this column.
    ///
    /// Empty cells in numeric columns become NULL; text columns keep the
    /// raw string unchanged. Integer cells may be written in any decimal
    /// notation (`1.0`, `1e3`) as long as the value is integral. Number
    /// cells keep their exact decimal text.
    pub fn to_sql_value(&self, raw: &str) -> Result<SqlValue, SchemaError> {
        let column_type = self.column_type().unwrap_or(ColumnType::String);
        let trimmed = raw.trim();
        match column_type {
            ColumnType::String => Ok(SqlValue::Text(raw.to_string())),
            _ if trimmed.is_empty() => Ok(SqlValue::Null),
            ColumnType::Integer => trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| DecimalLiteral::parse(trimmed)?.to_i64())
                .map(SqlValue::Integer)
                .ok_or_else(|| self.invalid(raw, "integer")),
            ColumnType::Number => DecimalLiteral::parse(trimmed)
                .map(|d| SqlValue::Decimal(d.canonical()))
                .ok_or_else(|| self.invalid(raw, "number")),
        }
    }

    fn invalid(&self, raw: &str, expected: &'static str) -> SchemaError {
        SchemaError::InvalidValue {
            column: self.name.clone(),
            value: raw.to_string(),
            expected,
        }
    }
}

/// Find a column definition by its declared name.
pub fn find_column<'a>(columns: &'a [Column], name: &str) -> Option<&'a Column> {
    columns.iter().find(|c| c.name == name)
}

/// Lowercase an identifier and replace spaces and colons with underscores.
///
/// This is not a general SQL identifier sanitizer; reserved words and other
/// characters pass through unchanged.
pub fn sanitize(identifier: &str) -> String {
    identifier.to_lowercase().replace([' ', ':'], "_")
}

/// Render the column list of a CREATE TABLE statement:
/// `col1 TYPE1, col2 TYPE2, ..., PRIMARY KEY(pk1, pk2)`.
///
/// A definition list without any primary key column is rejected here
/// rather than producing an invalid `PRIMARY KEY()` clause.
pub fn build_create_table(table: &str, columns: &[Column]) -> Result<String, SchemaError> {
    let mut defs = Vec::with_capacity(columns.len() + 1);
    let mut pk_names = Vec::new();
    for column in columns {
        let name = column.sql_name();
        defs.push(format!("{name} {}", column.column_type()?.sql_type()));
        if column.primary_key {
            pk_names.push(name);
        }
    }

    if pk_names.is_empty() {
        return Err(SchemaError::MissingPrimaryKey {
            table: table.to_string(),
        });
    }

    defs.push(format!("PRIMARY KEY({})", pk_names.join(", ")));
    Ok(defs.join(", "))
}

/// Full CREATE TABLE statement for a dataset table.
pub fn create_table_statement(table: &str, columns: &[Column]) -> Result<String, SchemaError> {
    Ok(format!(
        "CREATE TABLE {table} ({})",
        build_create_table(table, columns)?
    ))
}
