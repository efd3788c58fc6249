//! API handlers for the OryonTech sample service.
//!
//! Every response body carries a `timestamp` (UTC, RFC 3339). Database work
//! runs on the blocking pool; each request borrows its own connection and
//! returns it when the blocking task finishes, even if the client has gone.

use crate::{AppState, SERVICE_NAME};
use axum::{
    extract::Extension,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use oryon_db::health_checks::{self, format_timestamp, STATUS_HEALTHY};
use oryon_db::{Database, DbError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Window covered by `/metrics`.
const METRICS_WINDOW_HOURS: i64 = 1;

fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Paths advertised by the root descriptor.
#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointMap {
    pub health: String,
    pub database_health: String,
    pub info: String,
    pub metrics: String,
}

/// Response body for `GET /`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service: String,
    pub environment: String,
    pub version: String,
    pub endpoints: EndpointMap,
    pub timestamp: String,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub environment: String,
    pub timestamp: String,
}

/// Response body for a successful `GET /health/db`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseHealthResponse {
    pub status: String,
    pub database: String,
    pub connection_name: Option<String>,
    pub environment: String,
    /// Whether `SELECT 1` returned 1.
    pub test_query: bool,
    pub timestamp: String,
}

/// Response body for a failed `GET /health/db`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseUnhealthyResponse {
    pub status: String,
    pub database: String,
    pub error: String,
    pub timestamp: String,
}

/// Non-secret connection identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub instance: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
}

/// Response body for `GET /info`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub environment: String,
    pub database_configured: bool,
    pub openai_configured: bool,
    pub connection_info: ConnectionInfo,
    pub timestamp: String,
}

/// Response body for `GET /metrics`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub health_checks_last_hour: i64,
    /// Newest check in the window, `null` when there is none.
    pub last_check: Option<String>,
    pub timestamp: String,
}

/// Generic error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub timestamp: String,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database unhealthy: {0}")]
    DatabaseUnhealthy(DbError),
    #[error("failed to fetch metrics: {0}")]
    Metrics(DbError),
    #[error("internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let timestamp = now_timestamp();
        match self {
            ApiError::NotFound(path) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "Not found".to_string(),
                    path: Some(path),
                    timestamp,
                }),
            )
                .into_response(),
            ApiError::DatabaseUnhealthy(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(DatabaseUnhealthyResponse {
                    status: "unhealthy".to_string(),
                    database: "disconnected".to_string(),
                    error: e.to_string(),
                    timestamp,
                }),
            )
                .into_response(),
            ApiError::Metrics(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to fetch metrics".to_string(),
                    path: None,
                    timestamp,
                }),
            )
                .into_response(),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Internal server error".to_string(),
                    path: None,
                    timestamp,
                }),
            )
                .into_response(),
        }
    }
}

/// Runs `f` against the database on the blocking pool.
///
/// Returns `DbError::Unavailable` without touching the pool when startup
/// could not build one. A panic inside `f` is resumed on the request task so
/// the panic layer answers it.
async fn with_database<T, F>(state: &AppState, f: F) -> Result<T, DbError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, DbError> + Send + 'static,
{
    let Some(database) = state.database.clone() else {
        return Err(DbError::Unavailable);
    };

    match tokio::task::spawn_blocking(move || f(&database)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(DbError::Connection(format!("database task cancelled: {e}"))),
    }
}

/// Handler for `GET /`.
pub async fn index_handler(Extension(state): Extension<Arc<AppState>>) -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        service: SERVICE_NAME.to_string(),
        environment: state.service.environment.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: EndpointMap {
            health: "/health".to_string(),
            database_health: "/health/db".to_string(),
            info: "/info".to_string(),
            metrics: "/metrics".to_string(),
        },
        timestamp: now_timestamp(),
    })
}

/// Handler for `GET /health`. Never touches the database.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        environment: state.service.environment.clone(),
        timestamp: now_timestamp(),
    })
}

/// Handler for `GET /health/db`.
///
/// Probes the database and logs a health-check record in one transaction.
pub async fn database_health_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<DatabaseHealthResponse>, ApiError> {
    let environment = state.service.environment.clone();

    let result = with_database(&state, move |db| {
        let mut conn = db.acquire()?;
        let tx = conn.transaction()?;
        let test_query = health_checks::probe(&tx)?;
        health_checks::record_health_check(
            &tx,
            STATUS_HEALTHY,
            Some(environment.as_str()),
            Utc::now(),
        )?;
        tx.commit()?;
        Ok(test_query)
    })
    .await;

    match result {
        Ok(test_query) => Ok(Json(DatabaseHealthResponse {
            status: "healthy".to_string(),
            database: "connected".to_string(),
            connection_name: state.service.connection.instance.clone(),
            environment: state.service.environment.clone(),
            test_query,
            timestamp: now_timestamp(),
        })),
        Err(e) => {
            tracing::error!(error = %e, "database health check failed");
            Err(ApiError::DatabaseUnhealthy(e))
        }
    }
}

/// Handler for `GET /info`.
pub async fn info_handler(Extension(state): Extension<Arc<AppState>>) -> Json<InfoResponse> {
    let service = &state.service;
    Json(InfoResponse {
        environment: service.environment.clone(),
        database_configured: service.database_configured,
        openai_configured: service.openai_configured,
        connection_info: service.connection.clone(),
        timestamp: now_timestamp(),
    })
}

/// Handler for `GET /metrics`.
///
/// Reports the number of health checks logged in the last hour and the
/// newest one among them.
pub async fn metrics_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let cutoff = Utc::now() - Duration::hours(METRICS_WINDOW_HOURS);

    let summary = with_database(&state, move |db| {
        let conn = db.acquire()?;
        health_checks::summarize_since(&conn, cutoff)
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "failed to fetch metrics");
        ApiError::Metrics(e)
    })?;

    Ok(Json(MetricsResponse {
        health_checks_last_hour: summary.count,
        last_check: summary.last_check.map(format_timestamp),
        timestamp: now_timestamp(),
    }))
}

/// Fallback for unmatched routes.
pub async fn not_found_handler(uri: Uri) -> ApiError {
    tracing::debug!(path = uri.path(), "no route matched");
    ApiError::NotFound(uri.path().to_string())
}

/// Converts a handler panic into the generic 500 envelope.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };

    tracing::error!(panic = %detail, "internal error while handling request");
    ApiError::Internal.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn state_with_database(dir: &std::path::Path) -> AppState {
        let vars: HashMap<String, String> = [
            ("INSTANCE_CONNECTION_NAME", "oryon-test:local:db"),
            ("DB_USER", "app"),
            ("DB_PASSWORD", "secret"),
            ("DB_NAME", "oryon"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain([(
            "DB_SOCKET_DIR".to_string(),
            dir.to_string_lossy().into_owned(),
        )])
        .collect();
        let config =
            crate::config::load_config_with(None, move |key: &str| vars.get(key).cloned())
                .unwrap();
        std::fs::create_dir_all(config.database.validate().unwrap().mount()).unwrap();
        let database =
            Database::initialize(&config.database, oryon_db::PoolPolicy::default()).unwrap();
        AppState::new(&config, Some(database))
    }

    async fn blocking_panic_handler(
        Extension(state): Extension<Arc<AppState>>,
    ) -> Result<Json<()>, ApiError> {
        with_database(&state, |_db: &Database| -> Result<(), DbError> {
            panic!("blocking task blew up")
        })
        .await
        .map(Json)
        .map_err(ApiError::DatabaseUnhealthy)
    }

    async fn panicking_handler() -> &'static str {
        panic!("handler blew up")
    }

    async fn call(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn not_found_echoes_path() {
        let response = ApiError::NotFound("/missing".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Not found");
        assert_eq!(json["path"], "/missing");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn metrics_error_hides_details() {
        let response =
            ApiError::Metrics(DbError::Connection("secret host detail".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Failed to fetch metrics");
        assert!(json.get("path").is_none());
        assert!(!json.to_string().contains("secret host detail"));
    }

    #[tokio::test]
    async fn unavailable_database_is_503_with_message() {
        let response = ApiError::DatabaseUnhealthy(DbError::Unavailable).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["database"], "disconnected");
        assert_eq!(json["error"], "database is not configured");
    }

    #[tokio::test]
    async fn panic_payloads_become_generic_500() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(!json.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn panic_in_database_task_becomes_500_through_the_layers() {
        let dir = tempfile::tempdir().unwrap();
        let routes = Router::new()
            .route("/explode", get(blocking_panic_handler))
            .route("/health", get(health_handler));
        let app = crate::with_layers(routes, state_with_database(dir.path()));

        let response = call(app.clone(), "/explode").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response
            .headers()
            .contains_key(crate::middleware::REQUEST_ID_HEADER));
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(!json.to_string().contains("blew up"));

        let response = call(app, "/health").await;
        assert_eq!(response.status(), StatusCode::OK, "server keeps serving");
    }

    #[tokio::test]
    async fn panic_in_handler_becomes_500_through_the_layers() {
        let dir = tempfile::tempdir().unwrap();
        let routes = Router::new().route("/explode", get(panicking_handler));
        let app = crate::with_layers(routes, state_with_database(dir.path()));

        let response = call(app, "/explode").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
    }

    #[test]
    fn timestamps_are_utc_rfc3339() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'), "{ts}");
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
