//! # NonSpatial Server
//!
//! HTTP surface and persisted dataset resources on top of `nonspatial-core`.

pub mod api;
pub mod resources;

pub use api::{ApiError, AppState, router, run};
pub use resources::{DatasetResource, ResourceStore};
