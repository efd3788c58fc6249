mod common;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, Utc};
use oryon_db::health_checks::{format_timestamp, record_health_check, STATUS_HEALTHY};
use oryon_server::api::MetricsResponse;
use std::time::Duration;

#[tokio::test]
async fn empty_log_reports_zero_and_null_last_check() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _database) = common::reachable_app(dir.path(), Duration::from_secs(5));

    let (status, json) = common::get(&app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["health_checks_last_hour"], 0);
    assert!(json["last_check"].is_null());
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn count_tracks_successful_probes() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _database) = common::reachable_app(dir.path(), Duration::from_secs(5));

    let mut previous = 0;
    for expected in 1..=3 {
        let (status, _) = common::get(&app, "/health/db").await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = common::get(&app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let metrics: MetricsResponse = serde_json::from_value(json).unwrap();
        assert_eq!(metrics.health_checks_last_hour, expected);
        assert!(metrics.health_checks_last_hour >= previous);
        assert!(metrics.last_check.is_some());
        previous = metrics.health_checks_last_hour;
    }
}

#[tokio::test]
async fn records_older_than_an_hour_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let (app, database) = common::reachable_app(dir.path(), Duration::from_secs(5));

    let now = Utc::now();
    let recent = now - ChronoDuration::minutes(10);
    {
        let conn = database.acquire().unwrap();
        record_health_check(&conn, STATUS_HEALTHY, None, now - ChronoDuration::hours(3))
            .unwrap();
        record_health_check(&conn, STATUS_HEALTHY, None, now - ChronoDuration::minutes(61))
            .unwrap();
        record_health_check(&conn, STATUS_HEALTHY, Some("test"), recent).unwrap();
    }

    let (status, json) = common::get(&app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    let metrics: MetricsResponse = serde_json::from_value(json).unwrap();
    assert_eq!(metrics.health_checks_last_hour, 1);
    assert_eq!(metrics.last_check, Some(format_timestamp(recent)));
}

#[tokio::test]
async fn unconfigured_database_returns_generic_500() {
    let app = common::unconfigured_app(&[]);

    let (status, json) = common::get(&app, "/metrics").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Failed to fetch metrics");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn failing_query_returns_generic_500() {
    let dir = tempfile::tempdir().unwrap();
    let (app, database) = common::reachable_app(dir.path(), Duration::from_secs(5));
    // The migration stays recorded, so the table is not recreated.
    database
        .acquire()
        .unwrap()
        .execute_batch("DROP TABLE health_checks")
        .unwrap();

    let (status, json) = common::get(&app, "/metrics").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Failed to fetch metrics");
}
