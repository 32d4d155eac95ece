//! # NonSpatial Core
//!
//! Ingestion, cataloging and querying of non-spatial tabular datasets.
//! Datasets arrive either as a zip archive (one CSV file plus a Tabular Data
//! Resource description) or as a reference to an existing PostgreSQL table.
//! Each gets a catalog entry, and its rows are served back in pages or as a
//! full JSON/CSV export.

pub mod catalog;
pub mod config;
pub mod decimal;
pub mod descriptor;
pub mod error;
pub mod export;
pub mod ingest;
pub mod query;
pub mod registrar;
pub mod schema;
pub mod storage;

// Re-export commonly used types at the crate root.
pub use catalog::{CATALOG_TABLE, Catalog, CatalogEntry};
pub use config::{ServiceConfig, load_config};
pub use descriptor::TabularDataResource;
pub use error::{
    IngestError, NonSpatialError, RegistrationError, Result, SchemaError, StorageError,
};
pub use export::{ExportFormat, encode_as_csv};
pub use ingest::{ArchiveIngestor, IngestionParameters};
pub use query::{DatasetLocation, QueryEngine, QueryOptions, Record, SortSpec};
pub use registrar::RemoteRegistrar;
pub use schema::{Column, ColumnType};
pub use storage::{Backend, SharedBackend, SqlValue};

use std::sync::Arc;

/// The assembled dataset service: one catalog shared by the ingestor, the
/// registrar and the query engine.
#[derive(Debug, Clone)]
pub struct NonSpatialService {
    config: ServiceConfig,
    catalog: Arc<Catalog>,
    ingestor: ArchiveIngestor,
    registrar: RemoteRegistrar,
    query: QueryEngine,
}

impl NonSpatialService {
    /// Connect to the configured database and make sure the catalog exists.
    pub async fn connect(config: ServiceConfig) -> Result<Self> {
        let backend =
            storage::connect(&config.database.url, config.database.statement_timeout()).await?;
        tracing::info!(
            database = %storage::redact_url(&config.database.url),
            "Connected to dataset database"
        );
        Self::with_backend(config, backend).await
    }

    /// Build the service on an already opened backend.
    pub async fn with_backend(config: ServiceConfig, backend: SharedBackend) -> Result<Self> {
        let catalog = Arc::new(Catalog::new(
            backend,
            config.catalog.cache_size,
            config.catalog.max_name_attempts,
        ));
        catalog.create_catalog_table().await?;

        let ingestor = ArchiveIngestor::new(Arc::clone(&catalog), &config.ingest);
        let registrar = RemoteRegistrar::new(Arc::clone(&catalog));
        let query = QueryEngine::new(
            Arc::clone(&catalog),
            config.database.statement_timeout(),
            config.export.page_size,
            config.export.max_pages,
        );

        Ok(Self {
            config,
            catalog,
            ingestor,
            registrar,
            query,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn backend(&self) -> &SharedBackend {
        self.catalog.backend()
    }

    pub fn ingestor(&self) -> &ArchiveIngestor {
        &self.ingestor
    }

    pub fn registrar(&self) -> &RemoteRegistrar {
        &self.registrar
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query
    }
}
