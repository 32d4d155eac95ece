//! Error types for the non-spatial dataset core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering schema translation, storage, ingestion, registration and queries.

/// Top-level error type for the non-spatial dataset core.
#[derive(Debug, thiserror::Error)]
pub enum NonSpatialError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Dataset not found: {dataset_id}")]
    NotFound { dataset_id: i64 },

    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Export aborted after {max_pages} pages")]
    ExportLimitExceeded { max_pages: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NonSpatialError {
    /// HTTP status code reported for this error at the service boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            NonSpatialError::Schema(_) => 400,
            NonSpatialError::Storage(StorageError::Conflict { .. }) => 409,
            NonSpatialError::Storage(StorageError::Timeout { .. }) => 504,
            NonSpatialError::Storage(_) => 500,
            NonSpatialError::Ingest(IngestError::UnsupportedFileType { .. }) => 415,
            NonSpatialError::Ingest(_) => 400,
            NonSpatialError::Registration(_) => 400,
            NonSpatialError::NotFound { .. } => 404,
            NonSpatialError::UnsupportedFormat { .. } => 400,
            NonSpatialError::ExportLimitExceeded { .. } => 500,
            NonSpatialError::Io(_) => 500,
            NonSpatialError::Serialization(_) => 500,
        }
    }
}

/// Errors from translating column definitions into SQL.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Unsupported type: {type_name}")]
    UnsupportedType { type_name: String },

    #[error("No primary key column declared for '{table}'")]
    MissingPrimaryKey { table: String },

    #[error("Invalid {expected} value for column '{column}': {value:?}")]
    InvalidValue {
        column: String,
        value: String,
        expected: &'static str,
    },
}

/// Errors from the SQL execution layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Statement failed: {message} (SQL: {sql})")]
    Statement { sql: String, message: String },

    #[error("Conflicting object: {message}")]
    Conflict { message: String },

    #[error("Statement timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Could not decode column {column}: {message}")]
    Decode { column: usize, message: String },

    #[error("Unsupported database URL: {url}")]
    UnsupportedUrl { url: String },
}

/// Errors from unpacking and validating an uploaded archive.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unsupported file type: {content_type}")]
    UnsupportedFileType { content_type: String },

    #[error("Malformed archive: {reason}")]
    MalformedArchive { reason: String },
}

impl IngestError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedArchive {
            reason: reason.into(),
        }
    }
}

/// Errors from registering an externally hosted dataset.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid connection descriptor: {reason}")]
    InvalidConnectionDescriptor { reason: String },
}

impl RegistrationError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConnectionDescriptor {
            reason: reason.into(),
        }
    }
}

/// A type alias for results using the top-level `NonSpatialError`.
pub type Result<T> = std::result::Result<T, NonSpatialError>;
