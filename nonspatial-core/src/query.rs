//! Paged, filtered and sorted reads over dataset tables.

use crate::catalog::Catalog;
use crate::decimal::DecimalLiteral;
use crate::error::{NonSpatialError, Result};
use crate::schema::{self, Column, ColumnType};
use crate::storage::{self, Binder, Dialect, SharedBackend, SqlValue, Statement};
use serde::Serialize;
use serde::ser::SerializeMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// One result row: column names in schema order, paired with their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Vec<(String, SqlValue)>);

impl Record {
    pub fn new(fields: Vec<(String, SqlValue)>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&SqlValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn fields(&self) -> &[(String, SqlValue)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, SqlValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, SqlValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub ascending: bool,
}

/// Where a dataset's rows live when the caller already knows it.
///
/// A missing table is resolved through the catalog; a missing connection
/// string means the default database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetLocation {
    pub table: Option<String>,
    pub connection_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub start: usize,
    pub size: usize,
    /// Exact-match filters keyed by declared column name.
    pub filters: Option<BTreeMap<String, String>>,
    pub sort: Option<SortSpec>,
    /// Order by the primary key columns when no sort is given.
    pub stable_order: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start: 0,
            size: DEFAULT_PAGE_SIZE,
            filters: None,
            sort: None,
            stable_order: false,
        }
    }
}

fn find_sort_column<'a>(columns: &'a [Column], field: &str) -> Option<&'a Column> {
    columns
        .iter()
        .find(|c| c.name == field || c.sql_name() == field)
}

/// Build `SELECT * FROM table [WHERE ...] [ORDER BY ...] LIMIT n OFFSET m`.
///
/// Filters on undeclared columns and sorts on undeclared fields are ignored.
pub fn build_select(
    dialect: Dialect,
    table: &str,
    columns: &[Column],
    options: &QueryOptions,
) -> Result<Statement> {
    let mut binder = Binder::new(dialect);
    let mut sql = format!("SELECT * FROM {}", schema::sanitize(table));

    let mut conditions = Vec::new();
    for (key, raw) in options.filters.iter().flatten() {
        let Some(column) = schema::find_column(columns, key) else {
            tracing::debug!(filter = %key, "Ignoring filter on undeclared column");
            continue;
        };
        let value = if column.is_numeric() {
            column.to_sql_value(raw)?
        } else {
            SqlValue::Text(raw.clone())
        };
        conditions.push(format!("{} = {}", column.sql_name(), binder.bind(value)));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if let Some(sort) = &options.sort {
        match find_sort_column(columns, &sort.field) {
            Some(column) => {
                let direction = if sort.ascending { "ASC" } else { "DESC" };
                sql.push_str(&format!(" ORDER BY {} {direction}", column.sql_name()));
            }
            None => tracing::debug!(sort = %sort.field, "Ignoring sort on undeclared column"),
        }
    } else if options.stable_order {
        let keys: Vec<String> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(Column::sql_name)
            .collect();
        if !keys.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
    }

    // Anything past i64::MAX already means "no limit" to the database.
    let limit = binder.bind(SqlValue::Integer(clamp_to_i64(options.size)));
    let offset = binder.bind(SqlValue::Integer(clamp_to_i64(options.start)));
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

    Ok(Statement::with_params(sql, binder.into_params()))
}

fn clamp_to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Align a stored value with the column's declared type.
fn coerce(column: &Column, value: SqlValue) -> SqlValue {
    match (column.column_type(), value) {
        (Ok(ColumnType::Number), SqlValue::Integer(i)) => SqlValue::Number(i as f64),
        (Ok(ColumnType::Integer), SqlValue::Number(n)) if n.fract() == 0.0 => {
            SqlValue::Integer(n as i64)
        }
        (Ok(ColumnType::Integer), SqlValue::Decimal(d)) => {
            match DecimalLiteral::parse(&d).and_then(|literal| literal.to_i64()) {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Decimal(d),
            }
        }
        (_, value) => value,
    }
}

/// Zip result tuples positionally against the column definitions.
pub fn to_records(columns: &[Column], rows: Vec<Vec<SqlValue>>) -> Vec<Record> {
    rows.into_iter()
        .map(|row| {
            columns
                .iter()
                .zip(row)
                .map(|(column, value)| (column.name.clone(), coerce(column, value)))
                .collect()
        })
        .collect()
}

struct Target {
    backend: SharedBackend,
    table: String,
    columns: Vec<Column>,
}

/// Reads dataset rows through the catalog.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    catalog: Arc<Catalog>,
    statement_timeout: Duration,
    page_size: usize,
    max_pages: usize,
}

impl QueryEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        statement_timeout: Duration,
        page_size: usize,
        max_pages: usize,
    ) -> Self {
        Self {
            catalog,
            statement_timeout,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    async fn target(&self, dataset_id: i64, location: &DatasetLocation) -> Result<Target> {
        let entry = self.catalog.get_entry(dataset_id).await?;
        let table = location.table.clone().unwrap_or(entry.table_name);
        let backend = match &location.connection_string {
            Some(url) => storage::connect(url, self.statement_timeout).await?,
            None => Arc::clone(self.catalog.backend()),
        };
        Ok(Target {
            backend,
            table,
            columns: entry.columns,
        })
    }

    async fn fetch(&self, target: &Target, options: &QueryOptions) -> Result<Vec<Record>> {
        let stmt = build_select(target.backend.dialect(), &target.table, &target.columns, options)?;
        let rows = target.backend.query(&stmt.sql, &stmt.params).await?;
        Ok(to_records(&target.columns, rows))
    }

    /// Run one page of a query against a cataloged dataset.
    pub async fn query(
        &self,
        dataset_id: i64,
        options: &QueryOptions,
        location: &DatasetLocation,
    ) -> Result<Vec<Record>> {
        let target = self.target(dataset_id, location).await?;
        let records = self.fetch(&target, options).await?;
        tracing::debug!(dataset_id, table = %target.table, rows = records.len(), "Query served");
        Ok(records)
    }

    /// Read every row page by page until an empty page comes back.
    pub async fn export(&self, dataset_id: i64, location: &DatasetLocation) -> Result<Vec<Record>> {
        let target = self.target(dataset_id, location).await?;
        let mut all = Vec::new();
        for page in 0..self.max_pages {
            let options = QueryOptions {
                start: page * self.page_size,
                size: self.page_size,
                stable_order: true,
                ..Default::default()
            };
            let records = self.fetch(&target, &options).await?;
            if records.is_empty() {
                tracing::info!(dataset_id, rows = all.len(), pages = page, "Dataset exported");
                return Ok(all);
            }
            all.extend(records);
        }
        tracing::error!(dataset_id, max_pages = self.max_pages, "Export page limit reached");
        Err(NonSpatialError::ExportLimitExceeded {
            max_pages: self.max_pages,
        })
    }
}

/// Last value of a request parameter.
pub fn parse_string_param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Integer parameter; anything but a plain run of digits that fits a SQL
/// BIGINT yields the default.
pub fn parse_int_param(params: &[(String, String)], key: &str, default: usize) -> usize {
    match parse_string_param(params, key) {
        Some(v) if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => v
            .parse::<i64>()
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(default),
        _ => default,
    }
}

/// Collect repeated `filter=col:value` parameters, split on the first colon.
pub fn parse_filters(params: &[(String, String)]) -> Option<BTreeMap<String, String>> {
    let mut found = false;
    let mut filters = BTreeMap::new();
    for (_, raw) in params.iter().filter(|(k, _)| k == "filter") {
        found = true;
        match raw.trim().split_once(':') {
            Some((key, value)) => {
                filters.insert(key.to_string(), value.to_string());
            }
            None => tracing::debug!(filter = %raw, "Ignoring filter without ':'"),
        }
    }
    found.then_some(filters)
}

/// Parse the first `sort=field;asc|desc` parameter.
pub fn parse_sort(params: &[(String, String)]) -> Option<SortSpec> {
    let (_, raw) = params.iter().find(|(k, _)| k == "sort")?;
    let mut parts = raw.trim().split(';');
    let field = parts.next().unwrap_or_default().to_string();
    let ascending = parts.next() != Some("desc");
    Some(SortSpec { field, ascending })
}
