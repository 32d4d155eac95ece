//! Persisted dataset resources.
//!
//! A resource is the record kept after a successful ingestion or
//! registration: descriptive metadata plus where the rows live, so later
//! queries can skip the catalog lookup for the table name and reach remote
//! datasets through their connection string.

use nonspatial_core::error::{NonSpatialError, Result};
use nonspatial_core::storage::{Binder, SharedBackend, SqlValue};
use nonspatial_core::{DatasetLocation, IngestionParameters};
use serde::Serialize;

pub const RESOURCE_TABLE: &str = "nonspatial_resources";

const COLUMNS: &str =
    "dataset_id, title, name, dataset_abstract, database_table, postgres_url, created";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetResource {
    pub id: i64,
    pub title: String,
    pub name: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub database_table: String,
    #[serde(skip)]
    pub postgres_url: Option<String>,
    pub remote: bool,
    pub created: String,
}

impl DatasetResource {
    pub fn location(&self) -> DatasetLocation {
        DatasetLocation {
            table: Some(self.database_table.clone()),
            connection_string: self.postgres_url.clone(),
        }
    }

    fn from_row(row: Vec<SqlValue>) -> Option<Self> {
        let mut values = row.into_iter();
        let id = values.next()?.as_i64()?;
        let mut text = || values.next().unwrap_or(SqlValue::Null);
        let title = text().to_string();
        let name = text().to_string();
        let abstract_text = text().to_string();
        let database_table = text().to_string();
        let postgres_url = Some(text()).filter(|v| !v.is_null()).map(|v| v.to_string());
        let created = text().to_string();
        Some(Self {
            id,
            title,
            name,
            abstract_text,
            database_table,
            remote: postgres_url.is_some(),
            postgres_url,
            created,
        })
    }
}

/// Resource records in the default database, keyed by dataset id.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    backend: SharedBackend,
}

impl ResourceStore {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    pub async fn create_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {RESOURCE_TABLE} (\
             dataset_id BIGINT PRIMARY KEY, \
             title VARCHAR(256) NOT NULL, \
             name VARCHAR(256) NOT NULL, \
             dataset_abstract TEXT NOT NULL, \
             database_table VARCHAR(256) NOT NULL, \
             postgres_url TEXT, \
             created VARCHAR(64) NOT NULL)"
        );
        self.backend.execute(&ddl, &[]).await?;
        Ok(())
    }

    pub async fn insert(&self, params: &IngestionParameters) -> Result<DatasetResource> {
        let resource = DatasetResource {
            id: params.dataset_id,
            title: params.dataset_title.clone(),
            name: params.dataset_name.clone(),
            abstract_text: params.dataset_abstract.clone(),
            database_table: params.dataset_table.clone(),
            postgres_url: params.postgres_url.clone(),
            remote: params.postgres_url.is_some(),
            created: chrono::Utc::now().to_rfc3339(),
        };

        let mut binder = Binder::new(self.backend.dialect());
        let values = [
            binder.bind(SqlValue::Integer(resource.id)),
            binder.bind(SqlValue::Text(resource.title.clone())),
            binder.bind(SqlValue::Text(resource.name.clone())),
            binder.bind(SqlValue::Text(resource.abstract_text.clone())),
            binder.bind(SqlValue::Text(resource.database_table.clone())),
            binder.bind(
                resource
                    .postgres_url
                    .clone()
                    .map_or(SqlValue::Null, SqlValue::Text),
            ),
            binder.bind(SqlValue::Text(resource.created.clone())),
        ];
        let sql = format!(
            "INSERT INTO {RESOURCE_TABLE} ({COLUMNS}) VALUES ({})",
            values.join(", ")
        );
        self.backend.execute(&sql, &binder.into_params()).await?;
        tracing::info!(dataset_id = resource.id, remote = resource.remote, "Dataset resource saved");
        Ok(resource)
    }

    pub async fn get(&self, dataset_id: i64) -> Result<DatasetResource> {
        let mut binder = Binder::new(self.backend.dialect());
        let sql = format!(
            "SELECT {COLUMNS} FROM {RESOURCE_TABLE} WHERE dataset_id = {}",
            binder.bind(SqlValue::Integer(dataset_id))
        );
        let rows = self.backend.query(&sql, &binder.into_params()).await?;
        rows.into_iter()
            .next()
            .and_then(DatasetResource::from_row)
            .ok_or(NonSpatialError::NotFound { dataset_id })
    }

    /// All resources, newest first.
    pub async fn list(&self) -> Result<Vec<DatasetResource>> {
        let sql = format!("SELECT {COLUMNS} FROM {RESOURCE_TABLE} ORDER BY dataset_id DESC");
        let rows = self.backend.query(&sql, &[]).await?;
        Ok(rows.into_iter().filter_map(DatasetResource::from_row).collect())
    }
}
