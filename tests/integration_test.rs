use axum::http::StatusCode;
use litedb_api::api::{self, AppState};
use litedb_api::config::{Config, Environment};
use litedb_api::{init_db, Database, MigrationSource, PoolConfig};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn setup_test_app() -> (axum::Router, Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();

    let config = Config {
        addr: "127.0.0.1:0".to_string(),
        env: Environment::Testing,
        database_dsn: db_path.clone(),
        migrations_dir: None,
        pool: PoolConfig::default(),
    };

    let db = init_db(&db_path, &config.pool, &MigrationSource::embedded())
        .await
        .expect("init_db failed");
    let db = Arc::new(db);
    let state = AppState::new(db.clone(), config);

    (api::create_router(state), db, temp_dir)
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap();
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _db, _temp) = setup_test_app().await;

    let (status, body) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["env"], "testing");
}

#[tokio::test]
async fn test_ready_endpoint() {
    let (app, _db, _temp) = setup_test_app().await;

    let (status, body) = get(app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_ready_after_close_is_unavailable() {
    let (app, db, _temp) = setup_test_app().await;
    db.close().await.unwrap();

    let (status, body) = get(app, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("closed"));
}

#[tokio::test]
async fn test_migrations_endpoint_lists_applied() {
    let (app, _db, _temp) = setup_test_app().await;

    let (status, body) = get(app, "/v1/migrations").await;
    assert_eq!(status, StatusCode::OK);

    let source = MigrationSource::embedded();
    let expected: Vec<&str> = source.names().collect();
    let applied: Vec<&str> = body["applied"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(applied, expected);
    assert_eq!(body["count"], expected.len());
}
