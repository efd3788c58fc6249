//! OryonTech sample service library logic.

pub mod api;
pub mod config;
pub mod middleware;

use axum::{routing::get, Extension, Router};
use config::Config;
use oryon_db::{ConnectionConfig, Database, PoolPolicy};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;

/// Name reported by the root descriptor.
pub const SERVICE_NAME: &str = "OryonTech Agent Platform";

/// Application state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Database handle. `None` when the pool could not be built at startup.
    pub database: Option<Database>,
    /// Non-secret facts about this deployment.
    pub service: ServiceInfo,
    /// Upper bound on a single request.
    pub request_timeout: Duration,
}

/// Deployment facts echoed by the descriptor and info endpoints.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Environment label.
    pub environment: String,
    /// Whether an instance connection name was supplied.
    pub database_configured: bool,
    /// Whether a real external API key was supplied.
    pub openai_configured: bool,
    /// Non-secret connection identifiers.
    pub connection: api::ConnectionInfo,
}

impl ServiceInfo {
    /// Derives the service facts from configuration.
    pub fn from_config(config: &Config) -> Self {
        let db = &config.database;
        Self {
            environment: config.service.environment.clone(),
            database_configured: db.has_instance(),
            openai_configured: config.service.openai_configured(),
            connection: api::ConnectionInfo {
                instance: db.instance_connection_name.clone(),
                database: db.name.clone(),
                user: db.user.clone(),
            },
        }
    }
}

impl AppState {
    /// Builds the state from configuration and an optional database.
    pub fn new(config: &Config, database: Option<Database>) -> Self {
        Self {
            database,
            service: ServiceInfo::from_config(config),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        }
    }
}

/// Builds the pool and ensures the schema, tolerating failure.
///
/// A configuration error leaves the service without a database; the
/// liveness endpoint keeps working and database endpoints answer with a
/// controlled "not configured" failure. A schema error keeps the pool; the
/// first connection acquired once the instance is reachable sets the schema
/// up. Blocks for up to the pool's acquisition timeout.
pub fn bootstrap_database(config: &ConnectionConfig, policy: PoolPolicy) -> Option<Database> {
    let database = match Database::initialize(config, policy) {
        Ok(database) => database,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize database connection pool");
            return None;
        }
    };

    if let Err(e) = database.ensure_schema() {
        tracing::error!(error = %e, "failed to initialize database schema");
    }

    Some(database)
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let routes = Router::new()
        .route("/", get(api::index_handler))
        .route("/health", get(api::health_handler))
        .route("/health/db", get(api::database_health_handler))
        .route("/info", get(api::info_handler))
        .route("/metrics", get(api::metrics_handler))
        .fallback(api::not_found_handler);

    with_layers(routes, state)
}

/// Wraps `routes` in the panic, timeout and request-ID layers and injects
/// the shared state.
pub(crate) fn with_layers(routes: Router, state: AppState) -> Router {
    let request_timeout = state.request_timeout;

    routes
        .layer(CatchPanicLayer::custom(api::panic_response))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum::middleware::from_fn(middleware::request_id_layer))
        .layer(Extension(Arc::new(state)))
}
