//! Catalog of ingested and registered datasets.
//!
//! One registry table maps each assigned `dataset_id` to the physical table
//! holding its rows and the serialized column definitions. Entries are never
//! updated or deleted, so cached lookups never need invalidation.

use crate::error::{NonSpatialError, Result, StorageError};
use crate::schema::{self, Column};
use crate::storage::{Binder, SharedBackend, SqlValue, Statement};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Name of the registry relation.
pub const CATALOG_TABLE: &str = "non_spatial_datasets";

/// One row of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub dataset_id: i64,
    pub table_name: String,
    pub columns: Vec<Column>,
    pub created: Option<String>,
}

/// Registry of dataset tables, backed by the default database.
#[derive(Debug)]
pub struct Catalog {
    backend: SharedBackend,
    cache: Option<Mutex<LruCache<i64, CatalogEntry>>>,
    max_name_attempts: usize,
}

impl Catalog {
    pub fn new(backend: SharedBackend, cache_size: usize, max_name_attempts: usize) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|size| Mutex::new(LruCache::new(size)));
        Self {
            backend,
            cache,
            max_name_attempts: max_name_attempts.max(1),
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Create the registry relation if it does not exist yet.
    pub async fn create_catalog_table(&self) -> Result<()> {
        let ddl = self.backend.dialect().catalog_ddl(CATALOG_TABLE);
        self.backend.execute(&ddl, &[]).await?;
        tracing::debug!(table = CATALOG_TABLE, "Catalog table ready");
        Ok(())
    }

    /// Whether a table with this exact name exists in the default database.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        let sql = self.backend.dialect().table_exists_sql();
        let rows = self
            .backend
            .query(sql, &[SqlValue::Text(table_name.to_string())])
            .await?;
        Ok(first_i64(&rows).unwrap_or(0) > 0)
    }

    async fn cataloged(&self, table_name: &str) -> Result<bool> {
        let mut binder = Binder::new(self.backend.dialect());
        let sql = format!(
            "SELECT COUNT(*) FROM {CATALOG_TABLE} WHERE table_name = {}",
            binder.bind(SqlValue::Text(table_name.to_string()))
        );
        let rows = self.backend.query(&sql, &binder.into_params()).await?;
        Ok(first_i64(&rows).unwrap_or(0) > 0)
    }

    async fn name_taken(&self, table_name: &str) -> Result<bool> {
        Ok(self.table_exists(table_name).await? || self.cataloged(table_name).await?)
    }

    /// Sanitize a title and append `_0`, `_1`, ... until the name is free.
    ///
    /// A name is taken when a table of that name exists or a catalog entry
    /// (including a registered remote table) already uses it.
    pub async fn resolve_unique_table_name(&self, title: &str) -> Result<String> {
        let base = schema::sanitize(title);
        let mut candidate = base.clone();
        let mut suffix = 0usize;
        while self.name_taken(&candidate).await? {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        Ok(candidate)
    }

    fn entry_statement(&self, table_name: &str, columns: &[Column]) -> Result<Statement> {
        let definitions = serde_json::to_string(columns)?;
        let mut binder = Binder::new(self.backend.dialect());
        let sql = format!(
            "INSERT INTO {CATALOG_TABLE} (table_name, column_definitions) VALUES ({}, {})",
            binder.bind(SqlValue::Text(table_name.to_string())),
            binder.bind(SqlValue::Text(definitions)),
        );
        Ok(Statement::with_params(sql, binder.into_params()))
    }

    async fn dataset_id_for(&self, table_name: &str) -> Result<i64> {
        let mut binder = Binder::new(self.backend.dialect());
        let sql = format!(
            "SELECT dataset_id FROM {CATALOG_TABLE} WHERE table_name = {}",
            binder.bind(SqlValue::Text(table_name.to_string()))
        );
        let rows = self.backend.query(&sql, &binder.into_params()).await?;
        first_i64(&rows).ok_or_else(|| {
            StorageError::Decode {
                column: 0,
                message: format!("no catalog entry for table '{table_name}'"),
            }
            .into()
        })
    }

    /// Record a table in the catalog and return its assigned id.
    pub async fn insert_catalog_entry(&self, table_name: &str, columns: &[Column]) -> Result<i64> {
        let stmt = self.entry_statement(table_name, columns)?;
        self.backend.execute(&stmt.sql, &stmt.params).await?;
        let dataset_id = self.dataset_id_for(table_name).await?;
        tracing::info!(dataset_id, table = %table_name, "Catalog entry created");
        Ok(dataset_id)
    }

    /// Create a dataset table named after `title` and catalog it in one
    /// transaction.
    ///
    /// When another ingestion claims the resolved name first, the transaction
    /// fails with a conflict and the next free name is tried.
    pub async fn provision_dataset_table(
        &self,
        title: &str,
        columns: &[Column],
    ) -> Result<(i64, String)> {
        schema::build_create_table(&schema::sanitize(title), columns)?;

        for attempt in 0..self.max_name_attempts {
            let table_name = self.resolve_unique_table_name(title).await?;
            let statements = [
                Statement::new(schema::create_table_statement(&table_name, columns)?),
                self.entry_statement(&table_name, columns)?,
            ];
            match self.backend.execute_atomic(&statements).await {
                Ok(()) => {
                    let dataset_id = self.dataset_id_for(&table_name).await?;
                    tracing::info!(
                        dataset_id,
                        table = %table_name,
                        columns = columns.len(),
                        "Dataset table provisioned"
                    );
                    return Ok((dataset_id, table_name));
                }
                Err(StorageError::Conflict { message }) => {
                    tracing::warn!(
                        attempt,
                        table = %table_name,
                        error = %message,
                        "Table name claimed concurrently, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::Conflict {
            message: format!(
                "no free table name for '{title}' after {} attempts",
                self.max_name_attempts
            ),
        }
        .into())
    }

    /// Look up a catalog entry; unknown ids are `NotFound`.
    pub async fn get_entry(&self, dataset_id: i64) -> Result<CatalogEntry> {
        if let Some(entry) = self.cached(dataset_id) {
            return Ok(entry);
        }

        let mut binder = Binder::new(self.backend.dialect());
        let sql = format!(
            "SELECT table_name, column_definitions, CAST(created AS TEXT) \
             FROM {CATALOG_TABLE} WHERE dataset_id = {}",
            binder.bind(SqlValue::Integer(dataset_id))
        );
        let rows = self.backend.query(&sql, &binder.into_params()).await?;
        let Some(row) = rows.into_iter().next() else {
            return Err(NonSpatialError::NotFound { dataset_id });
        };

        let mut values = row.into_iter();
        let table_name = values.next().unwrap_or(SqlValue::Null).to_string();
        let definitions = values.next().unwrap_or(SqlValue::Null).to_string();
        let created = values
            .next()
            .filter(|v| !v.is_null())
            .map(|v| v.to_string());

        let entry = CatalogEntry {
            dataset_id,
            table_name,
            columns: serde_json::from_str(&definitions)?,
            created,
        };
        self.remember(&entry);
        Ok(entry)
    }

    pub async fn resolve_dataset_table(&self, dataset_id: i64) -> Result<String> {
        Ok(self.get_entry(dataset_id).await?.table_name)
    }

    pub async fn get_column_definitions(&self, dataset_id: i64) -> Result<Vec<Column>> {
        Ok(self.get_entry(dataset_id).await?.columns)
    }

    fn cached(&self, dataset_id: i64) -> Option<CatalogEntry> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().ok()?;
        cache.get(&dataset_id).cloned()
    }

    fn remember(&self, entry: &CatalogEntry) {
        if let Some(cache) = &self.cache
            && let Ok(mut cache) = cache.lock()
        {
            cache.put(entry.dataset_id, entry.clone());
        }
    }
}

fn first_i64(rows: &[Vec<SqlValue>]) -> Option<i64> {
    rows.first()?.first()?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use crate::storage::SqliteBackend;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    async fn catalog() -> Catalog {
        let backend = SqliteBackend::open_in_memory(Duration::from_secs(5)).unwrap();
        let catalog = Catalog::new(Arc::new(backend), 16, 8);
        catalog.create_catalog_table().await.unwrap();
        catalog
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Integer).primary(),
            Column::new("name", ColumnType::String),
        ]
    }

    #[tokio::test]
    async fn test_create_catalog_table_is_idempotent() {
        let catalog = catalog().await;
        catalog.create_catalog_table().await.unwrap();
        assert!(catalog.table_exists(CATALOG_TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_unique_table_name_suffixes() {
        let catalog = catalog().await;
        assert_eq!(
            catalog.resolve_unique_table_name("My Title").await.unwrap(),
            "my_title"
        );
        catalog
            .backend()
            .execute("CREATE TABLE my_title (id INT)", &[])
            .await
            .unwrap();
        assert_eq!(
            catalog.resolve_unique_table_name("My Title").await.unwrap(),
            "my_title_0"
        );
        catalog
            .backend()
            .execute("CREATE TABLE my_title_0 (id INT)", &[])
            .await
            .unwrap();
        assert_eq!(
            catalog.resolve_unique_table_name("My Title").await.unwrap(),
            "my_title_1"
        );
    }

    #[tokio::test]
    async fn test_cataloged_remote_name_is_taken() {
        let catalog = catalog().await;
        catalog.insert_catalog_entry("orders", &columns()).await.unwrap();
        assert!(!catalog.table_exists("orders").await.unwrap());
        assert_eq!(
            catalog.resolve_unique_table_name("Orders").await.unwrap(),
            "orders_0"
        );
    }

    #[tokio::test]
    async fn test_insert_and_get_entry() {
        let catalog = catalog().await;
        let id = catalog.insert_catalog_entry("people", &columns()).await.unwrap();

        let entry = catalog.get_entry(id).await.unwrap();
        assert_eq!(entry.dataset_id, id);
        assert_eq!(entry.table_name, "people");
        assert_eq!(entry.columns, columns());
        assert!(entry.created.is_some());

        assert_eq!(catalog.resolve_dataset_table(id).await.unwrap(), "people");
        assert_eq!(catalog.get_column_definitions(id).await.unwrap(), columns());
    }

    #[tokio::test]
    async fn test_duplicate_catalog_entry_conflicts() {
        let catalog = catalog().await;
        catalog.insert_catalog_entry("people", &columns()).await.unwrap();
        let err = catalog
            .insert_catalog_entry("people", &columns())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_not_found() {
        let catalog = catalog().await;
        let err = catalog.get_entry(42).await.unwrap_err();
        assert!(matches!(err, NonSpatialError::NotFound { dataset_id: 42 }));
        assert!(catalog.resolve_dataset_table(42).await.is_err());
    }

    #[tokio::test]
    async fn test_provision_creates_table_and_entry() {
        let catalog = catalog().await;
        let (id, table) = catalog
            .provision_dataset_table("Census Data", &columns())
            .await
            .unwrap();
        assert_eq!(table, "census_data");
        assert!(catalog.table_exists(&table).await.unwrap());
        assert_eq!(catalog.resolve_dataset_table(id).await.unwrap(), table);

        let (second_id, second) = catalog
            .provision_dataset_table("Census Data", &columns())
            .await
            .unwrap();
        assert_ne!(id, second_id);
        assert_eq!(second, "census_data_0");
    }

    #[tokio::test]
    async fn test_provision_without_primary_key_issues_no_sql() {
        let catalog = catalog().await;
        let columns = vec![Column::new("a", ColumnType::Integer)];
        let err = catalog
            .provision_dataset_table("No Key", &columns)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NonSpatialError::Schema(crate::error::SchemaError::MissingPrimaryKey { .. })
        ));
        assert!(!catalog.table_exists("no_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_provision_unknown_type_leaves_no_orphan() {
        let catalog = catalog().await;
        let mut bad = Column::new("a", ColumnType::Integer).primary();
        bad.type_name = "geopoint".into();
        let err = catalog
            .provision_dataset_table("Bad", &[bad])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(!catalog.table_exists("bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_serves_repeated_lookups() {
        let catalog = catalog().await;
        let id = catalog.insert_catalog_entry("cached", &columns()).await.unwrap();
        let first = catalog.get_entry(id).await.unwrap();

        // Entries are immutable; the cached copy survives a direct table edit.
        catalog
            .backend()
            .execute(
                &format!("UPDATE {CATALOG_TABLE} SET table_name = 'changed'"),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(catalog.get_entry(id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let backend = SqliteBackend::open_in_memory(Duration::from_secs(5)).unwrap();
        let catalog = Catalog::new(Arc::new(backend), 0, 8);
        catalog.create_catalog_table().await.unwrap();
        let id = catalog.insert_catalog_entry("plain", &columns()).await.unwrap();
        assert_eq!(catalog.resolve_dataset_table(id).await.unwrap(), "plain");
    }
}
