use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use parcelhub::jwt::JwtConfig;

async fn seed_admin_org(pool: &SqlitePool) -> (Uuid, String) {
    let now = Utc::now();
    let user = Uuid::new_v4();
    let org = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, is_operator, created_at, updated_at) VALUES (?, 'Admin', 'admin@example.com', 'hash', 0, ?, ?)",
    )
    .bind(user)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO organizations (id, name, is_unitary, created_at, updated_at) VALUES (?, 'acme', 0, ?, ?)",
    )
    .bind(org)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();

    let admin_role: Uuid =
        sqlx::query_scalar("SELECT id FROM roles WHERE organization_id IS NULL AND name = 'Administrator'")
            .fetch_one(pool)
            .await
            .unwrap();

    sqlx::query(
        "INSERT INTO memberships (id, user_id, organization_id, role_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(user)
    .bind(org)
    .bind(admin_role)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();

    let jwt = JwtConfig {
        secret: Arc::new(b"test_secret".to_vec()),
        exp_hours: 1,
    };

    (org, jwt.encode(user, false).unwrap())
}

async fn send(app: &Router, method: &str, uri: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token));

    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, value)
}

async fn create_package(app: &Router, org: Uuid, token: &str, name: &str) -> Uuid {
    let (status, body) = send(
        app,
        "POST",
        &format!("/orgs/{}/packages", org),
        token,
        Some(json!({"name": name})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
}

async fn publish_version(app: &Router, org: Uuid, package: Uuid, token: &str, version: &str) -> Uuid {
    let (status, body) = send(
        app,
        "POST",
        &format!("/orgs/{}/packages/{}/versions", org, package),
        token,
        Some(json!({"version": version})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    Uuid::parse_str(body["id"].as_str().unwrap()).unwrap()
}

#[sqlx::test]
async fn archiving_a_package_cascades_to_its_active_versions(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, token) = seed_admin_org(&pool).await;
    let package = create_package(&app, org, &token, "left-pad").await;
    let v1 = publish_version(&app, org, package, &token, "1.0.0").await;
    let v2 = publish_version(&app, org, package, &token, "1.1.0").await;

    let (status, body) = send(
        &app,
        "PATCH",
        &format!("/orgs/{}/packages/{}", org, package),
        &token,
        Some(json!({"archived": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["archived_at"].is_string());

    for version in [v1, v2] {
        let archived_at: Option<chrono::DateTime<Utc>> =
            sqlx::query_scalar("SELECT archived_at FROM package_versions WHERE id = ?")
                .bind(version)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(archived_at.is_some(), "version {} should be archived", version);
    }
}

#[sqlx::test]
async fn version_restore_is_blocked_while_the_package_is_archived(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, token) = seed_admin_org(&pool).await;
    let package = create_package(&app, org, &token, "left-pad").await;
    let v1 = publish_version(&app, org, package, &token, "1.0.0").await;

    send(
        &app,
        "PATCH",
        &format!("/orgs/{}/packages/{}", org, package),
        &token,
        Some(json!({"archived": true})),
    )
    .await;

    let version_uri = format!("/orgs/{}/packages/{}/versions/{}", org, package, v1);

    let (status, body) = send(&app, "PATCH", &version_uri, &token, Some(json!({"archived": false}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");

    // Restore the package first, then the version restore succeeds.
    send(
        &app,
        "PATCH",
        &format!("/orgs/{}/packages/{}", org, package),
        &token,
        Some(json!({"archived": false})),
    )
    .await;

    let (status, body) = send(&app, "PATCH", &version_uri, &token, Some(json!({"archived": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["archived_at"].is_null());
}

#[sqlx::test]
async fn deletion_is_terminal(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, token) = seed_admin_org(&pool).await;
    let package = create_package(&app, org, &token, "left-pad").await;
    let v1 = publish_version(&app, org, package, &token, "1.0.0").await;
    let package_uri = format!("/orgs/{}/packages/{}", org, package);

    let (status, _) = send(&app, "PATCH", &package_uri, &token, Some(json!({"deleted": true}))).await;
    assert_eq!(status, StatusCode::OK);

    // No further package mutation.
    let (status, body) = send(&app, "PATCH", &package_uri, &token, Some(json!({"archived": true}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_deleted");

    let (status, body) = send(&app, "PATCH", &package_uri, &token, Some(json!({"deleted": false}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");

    // A deleted parent blocks version mutations too.
    let version_uri = format!("/orgs/{}/packages/{}/versions/{}", org, package, v1);
    let (status, body) = send(&app, "PATCH", &version_uri, &token, Some(json!({"archived": true}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[sqlx::test]
async fn publishing_to_an_archived_package_is_rejected(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, token) = seed_admin_org(&pool).await;
    let package = create_package(&app, org, &token, "left-pad").await;

    send(
        &app,
        "PATCH",
        &format!("/orgs/{}/packages/{}", org, package),
        &token,
        Some(json!({"archived": true})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/orgs/{}/packages/{}/versions", org, package),
        &token,
        Some(json!({"version": "2.0.0"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[sqlx::test]
async fn downloads_are_recorded_for_live_versions_only(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, token) = seed_admin_org(&pool).await;
    let package = create_package(&app, org, &token, "left-pad").await;
    let v1 = publish_version(&app, org, package, &token, "1.0.0").await;

    let download_uri = format!("/orgs/{}/packages/{}/versions/{}/download", org, package, v1);

    let (status, _) = send(&app, "POST", &download_uri, &token, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app,
        "GET",
        &format!("/orgs/{}/packages/{}/versions/{}/downloads", org, package, v1),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Archive the version: downloads stop.
    send(
        &app,
        "PATCH",
        &format!("/orgs/{}/packages/{}/versions/{}", org, package, v1),
        &token,
        Some(json!({"archived": true})),
    )
    .await;

    let (status, body) = send(&app, "POST", &download_uri, &token, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}
