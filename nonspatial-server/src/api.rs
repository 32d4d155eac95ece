//! HTTP API for non-spatial datasets.
//!
//! Endpoints:
//! - `POST /api/v2/nonspatialdatasets`: register (JSON body) or ingest a zip
//!   archive (multipart `file` part)
//! - `GET /api/v2/nonspatialdatasets`: list dataset resources
//! - `GET /api/v2/nonspatialdatasets/{id}`: one dataset resource
//! - `GET /api/v2/nonspatialdatasets/{id}/data`: paged, filtered, sorted rows
//! - `GET /api/v2/nonspatialdatasets/{id}/export`: every row as JSON or CSV
//! - `GET /health`
//!
//! Data and export failures are reported as a `{status_code, error}` body
//! with HTTP 200; ingestion failures use the matching HTTP status.

use crate::resources::ResourceStore;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, RawQuery, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use nonspatial_core::config::ServerConfig;
use nonspatial_core::query::{parse_filters, parse_int_param, parse_sort, parse_string_param};
use nonspatial_core::{ExportFormat, NonSpatialError, NonSpatialService, QueryOptions};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: Arc<NonSpatialService>,
    pub resources: Arc<ResourceStore>,
}

impl AppState {
    /// Wire the resource store onto the service's default database.
    pub async fn new(service: NonSpatialService) -> nonspatial_core::Result<Self> {
        let resources = ResourceStore::new(Arc::clone(service.backend()));
        resources.create_table().await?;
        Ok(Self {
            service: Arc::new(service),
            resources: Arc::new(resources),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub status_code: u16,
    pub error: String,
}

/// Errors surfaced by the API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] NonSpatialError),

    #[error("{0}")]
    BadRequest(String),

    /// A path segment that is not a dataset id; answered like a missing one.
    #[error("Invalid dataset id: {0:?}")]
    InvalidId(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Service(e) => e.status_code(),
            ApiError::BadRequest(_) => 400,
            ApiError::InvalidId(_) => 404,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let status_code = self.status_code();
        let error = match status_code {
            404 => "The resource was not found".to_string(),
            500.. => format!("Internal Server Error: {self}"),
            _ => self.to_string(),
        };
        ErrorPayload { status_code, error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.payload())).into_response()
    }
}

/// Render a read failure as a payload with HTTP 200.
fn error_payload(err: impl Into<ApiError>) -> Response {
    let err = err.into();
    if err.status_code() >= 500 {
        tracing::error!(error = %err, "Dataset read failed");
    }
    Json(err.payload()).into_response()
}

fn parse_dataset_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse().map_err(|_| {
        tracing::debug!(id = %raw, "Rejecting non-numeric dataset id");
        ApiError::InvalidId(raw.to_string())
    })
}

fn query_pairs(raw: Option<String>) -> Vec<(String, String)> {
    raw.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let max_upload_bytes = state.service.config().server.max_upload_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/v2/nonspatialdatasets",
            get(list_datasets).post(create_dataset),
        )
        .route("/api/v2/nonspatialdatasets/{id}", get(get_dataset))
        .route("/api/v2/nonspatialdatasets/{id}/data", get(dataset_data))
        .route("/api/v2/nonspatialdatasets/{id}/export", get(export_dataset))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the API server and serve until Ctrl-C.
pub async fn run(state: AppState, config: &ServerConfig) -> Result<(), std::io::Error> {
    let app = router(state);
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Non-spatial dataset API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_datasets(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.resources.list().await?))
}

async fn get_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_dataset_id(&id)?;
    Ok(Json(state.resources.get(id).await?))
}

/// Register a remote dataset from a JSON body, or ingest an uploaded archive.
async fn create_dataset(State(state): State<AppState>, req: Request) -> Result<Response, ApiError> {
    let is_json = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    let params = if is_json {
        let Json(body) = Json::<Value>::from_request(req, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        if body.is_null() || body.as_object().is_some_and(|o| o.is_empty()) {
            return Err(ApiError::BadRequest("No POST body provided".into()));
        }
        state.service.registrar().register(body).await?
    } else {
        let multipart = Multipart::from_request(req, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        ingest_upload(&state, multipart).await?
    };

    let resource = state.resources.insert(&params).await?;
    Ok(Json(json!({"id": resource.id})).into_response())
}

async fn ingest_upload(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<nonspatial_core::IngestionParameters, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        let ingestor = state.service.ingestor();
        let stored = ingestor.store_upload(&file_name, &bytes).await?;
        return Ok(ingestor
            .ingest_zipped_dataset(&stored, content_type.as_deref())
            .await?);
    }
    Err(ApiError::BadRequest("No 'file' part provided".into()))
}

async fn dataset_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let resource = match parse_dataset_id(&id) {
        Ok(id) => state.resources.get(id).await.map_err(ApiError::from),
        Err(e) => Err(e),
    };
    let resource = match resource {
        Ok(resource) => resource,
        Err(e) => return error_payload(e),
    };

    let params = query_pairs(raw);
    let options = QueryOptions {
        start: parse_int_param(&params, "start", 0),
        size: parse_int_param(&params, "size", nonspatial_core::query::DEFAULT_PAGE_SIZE),
        filters: parse_filters(&params),
        sort: parse_sort(&params),
        stable_order: false,
    };

    match state
        .service
        .query_engine()
        .query(resource.id, &options, &resource.location())
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_payload(e),
    }
}

async fn export_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let resource = match parse_dataset_id(&id) {
        Ok(id) => state.resources.get(id).await.map_err(ApiError::from),
        Err(e) => Err(e),
    };
    let resource = match resource {
        Ok(resource) => resource,
        Err(e) => return error_payload(e),
    };

    let params = query_pairs(raw);
    let format = match parse_string_param(&params, "format")
        .unwrap_or("csv")
        .parse::<ExportFormat>()
    {
        Ok(format) => format,
        Err(e) => return error_payload(e),
    };

    let records = match state
        .service
        .query_engine()
        .export(resource.id, &resource.location())
        .await
    {
        Ok(records) => records,
        Err(e) => return error_payload(e),
    };

    match format {
        ExportFormat::Json => Json(records).into_response(),
        ExportFormat::Csv => match format.encode(&records) {
            Ok(body) => {
                let length = HeaderValue::from(body.len());
                (
                    [
                        (header::CONTENT_TYPE, HeaderValue::from_static("text/csv")),
                        (header::CONTENT_LENGTH, length),
                    ],
                    body,
                )
                    .into_response()
            }
            Err(e) => error_payload(e),
        },
    }
}
