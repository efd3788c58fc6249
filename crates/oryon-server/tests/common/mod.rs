#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use oryon_db::{Database, PoolPolicy};
use oryon_server::config::{load_config_with, Config};
use oryon_server::{app, bootstrap_database, AppState};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tower::ServiceExt;

/// Builds a config whose instance mount lives under `socket_dir`.
pub fn config_for(socket_dir: &Path, extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("INSTANCE_CONNECTION_NAME", "oryon-test:local:db"),
        ("DB_USER", "app"),
        ("DB_PASSWORD", "secret"),
        ("DB_NAME", "oryon"),
        ("ENVIRONMENT", "test"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert(
        "DB_SOCKET_DIR".to_string(),
        socket_dir.to_string_lossy().into_owned(),
    );
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }

    load_config_with(None, move |key: &str| vars.get(key).cloned()).expect("test config")
}

/// Creates the instance mount so connections succeed.
pub fn create_mount(config: &Config) {
    let target = config.database.validate().expect("complete database config");
    std::fs::create_dir_all(target.mount()).expect("create instance mount");
}

pub fn policy(acquire_timeout: Duration) -> PoolPolicy {
    PoolPolicy {
        acquire_timeout,
        ..PoolPolicy::default()
    }
}

/// A router backed by a reachable database, plus a handle to that database.
pub fn reachable_app(socket_dir: &Path, acquire_timeout: Duration) -> (Router, Database) {
    let config = config_for(socket_dir, &[]);
    create_mount(&config);
    let database =
        bootstrap_database(&config.database, policy(acquire_timeout)).expect("database");
    let state = AppState::new(&config, Some(database.clone()));
    (app(state), database)
}

/// A router whose startup never produced a pool.
pub fn unconfigured_app(extra: &[(&str, &str)]) -> Router {
    let vars: HashMap<String, String> = extra
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = load_config_with(None, move |key: &str| vars.get(key).cloned()).unwrap();
    let database = bootstrap_database(&config.database, PoolPolicy::default());
    assert!(database.is_none(), "incomplete config must not produce a pool");
    app(AppState::new(&config, database))
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

pub fn record_count(database: &Database) -> i64 {
    let conn = database.acquire().expect("acquire");
    conn.query_row("SELECT COUNT(*) FROM health_checks", [], |row| row.get(0))
        .expect("count records")
}
