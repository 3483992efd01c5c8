//! NekoDrive Gateway library
//!
//! The engine services (upload sessions, read path, lifecycle and
//! maintenance) and the HTTP surface over them. Re-exports the pieces the
//! binary and the integration tests need.

#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]

pub mod config;
pub mod error;
mod files_api;
pub mod lifecycle;
pub mod maintenance_daemon;
pub mod metrics;
pub mod reader;
pub mod sessions;
pub mod state;
mod system_api;
mod upload_api;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, GatewayConfig, SubstrateKind};
pub use error::{ApiError, ApiResult};
pub use lifecycle::{GcReport, LifecycleService, PurgeReport, SweepReport};
pub use maintenance_daemon::{MaintenanceConfig, MaintenanceDaemon};
pub use reader::{FileReader, OpenFile};
pub use sessions::{ChunkReceipt, ResumeView, SessionManager, StartUpload, UploadTicket};
pub use state::{AppState, SharedShardStore};
pub use upload_api::CHUNK_DIGEST_HEADER;

use axum::http::{header, Method};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// CORS policy for the API
///
/// Permissive mode allows any origin. Otherwise only the configured origins
/// may call the API, with the methods and headers the routes actually use.
pub fn cors_layer(server: &config::ServerSettings) -> Result<CorsLayer, ConfigError> {
    if server.cors_permissive {
        return Ok(CorsLayer::permissive());
    }
    Ok(CorsLayer::new()
        .allow_origin(server.origin_headers()?)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static(CHUNK_DIGEST_HEADER),
        ]))
}

/// Every API route, traced, with state applied
pub fn app(state: Arc<AppState>) -> Router {
    let max_chunk = state.codec().chunk_size();
    Router::new()
        .merge(upload_api::routes(max_chunk))
        .merge(files_api::routes())
        .merge(system_api::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
