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

async fn insert_user(pool: &SqlitePool, email: &str) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, is_operator, created_at, updated_at) VALUES (?, ?, ?, 'hash', 0, ?, ?)",
    )
    .bind(id)
    .bind(email)
    .bind(email)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn insert_org(pool: &SqlitePool, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO organizations (id, name, is_unitary, created_at, updated_at) VALUES (?, ?, 0, ?, ?)",
    )
    .bind(id)
    .bind(name)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn global_role_id(pool: &SqlitePool, name: &str) -> Uuid {
    sqlx::query_scalar("SELECT id FROM roles WHERE organization_id IS NULL AND name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn insert_membership(pool: &SqlitePool, user: Uuid, org: Uuid, role: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO memberships (id, user_id, organization_id, role_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user)
    .bind(org)
    .bind(role)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();
    id
}

fn token_for(user: Uuid) -> String {
    let jwt = JwtConfig {
        secret: Arc::new(b"test_secret".to_vec()),
        exp_hours: 1,
    };
    jwt.encode(user, false).unwrap()
}

async fn patch(app: &Router, token: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

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

/// Org with one Administrator (returned token) and one Publisher membership.
async fn seed_org_with_member(pool: &SqlitePool) -> (Uuid, Uuid, String) {
    let admin_role = global_role_id(pool, "Administrator").await;
    let publisher_role = global_role_id(pool, "Publisher").await;

    let admin = insert_user(pool, "admin@example.com").await;
    let member = insert_user(pool, "member@example.com").await;
    let org = insert_org(pool, "acme").await;

    insert_membership(pool, admin, org, admin_role).await;
    let membership = insert_membership(pool, member, org, publisher_role).await;

    (org, membership, token_for(admin))
}

#[sqlx::test]
async fn empty_delta_is_idempotent(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, membership, token) = seed_org_with_member(&pool).await;
    let uri = format!("/orgs/{}/memberships/{}", org, membership);

    let (status1, first) = patch(&app, &token, &uri, json!({})).await;
    let (status2, second) = patch(&app, &token, &uri, json!({})).await;

    assert_eq!(status1, StatusCode::OK);
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(first, second);
    assert!(first["deleted_at"].is_null());
}

#[sqlx::test]
async fn reactivation_resets_join_date(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, membership, token) = seed_org_with_member(&pool).await;
    let uri = format!("/orgs/{}/memberships/{}", org, membership);

    let (_, before) = patch(&app, &token, &uri, json!({})).await;

    let (status, revoked) = patch(&app, &token, &uri, json!({"revoked": true})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(revoked["deleted_at"].is_string());

    let (status, restored) = patch(&app, &token, &uri, json!({"revoked": false})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(restored["deleted_at"].is_null());

    // The historical join date is discarded on reactivation.
    assert_ne!(before["created_at"], restored["created_at"]);
}

#[sqlx::test]
async fn reactivation_fails_when_role_was_deleted(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let admin_role = global_role_id(&pool, "Administrator").await;
    let admin = insert_user(&pool, "admin@example.com").await;
    let member = insert_user(&pool, "member@example.com").await;
    let org = insert_org(&pool, "acme").await;
    insert_membership(&pool, admin, org, admin_role).await;

    let token = token_for(admin);

    // Custom role, assigned, revoked, then physically deleted.
    let create_role = Request::builder()
        .method("POST")
        .uri(format!("/orgs/{}/roles", org))
        .header("Authorization", format!("Bearer {}", token))
        .header("Content-Type", "application/json")
        .body(Body::from(
            json!({"name": "Temp", "permissions": ["read:packages"]}).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(create_role).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let role: Value = serde_json::from_slice(&bytes).unwrap();
    let role_id = Uuid::parse_str(role["id"].as_str().unwrap()).unwrap();

    let membership = insert_membership(&pool, member, org, role_id).await;
    let uri = format!("/orgs/{}/memberships/{}", org, membership);

    let (status, _) = patch(&app, &token, &uri, json!({"revoked": true})).await;
    assert_eq!(status, StatusCode::OK);

    let delete_role = Request::builder()
        .method("DELETE")
        .uri(format!("/orgs/{}/roles/{}", org, role_id))
        .header("Authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(delete_role).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, body) = patch(&app, &token, &uri, json!({"revoked": false})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["message"], "not found: role does not exist");

    // Still revoked.
    let deleted_at: Option<chrono::DateTime<Utc>> =
        sqlx::query_scalar("SELECT deleted_at FROM memberships WHERE id = ?")
            .bind(membership)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(deleted_at.is_some());
}

#[sqlx::test]
async fn role_change_on_revoked_membership_is_rejected(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, membership, token) = seed_org_with_member(&pool).await;
    let user_role = global_role_id(&pool, "User").await;
    let uri = format!("/orgs/{}/memberships/{}", org, membership);

    patch(&app, &token, &uri, json!({"revoked": true})).await;

    let (status, body) = patch(&app, &token, &uri, json!({"role_id": user_role})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[sqlx::test]
async fn duplicate_active_membership_is_rejected(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let admin_role = global_role_id(&pool, "Administrator").await;
    let user_role = global_role_id(&pool, "User").await;
    let admin = insert_user(&pool, "admin@example.com").await;
    let member = insert_user(&pool, "member@example.com").await;
    let org = insert_org(&pool, "acme").await;
    insert_membership(&pool, admin, org, admin_role).await;
    insert_membership(&pool, member, org, user_role).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/orgs/{}/memberships", org))
        .header("Authorization", format!("Bearer {}", token_for(admin)))
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"user_id": member, "role_id": user_role}).to_string()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[sqlx::test]
async fn reactivation_into_deactivated_org_is_rejected(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let (org, membership, token) = seed_org_with_member(&pool).await;
    let uri = format!("/orgs/{}/memberships/{}", org, membership);

    patch(&app, &token, &uri, json!({"revoked": true})).await;

    let (status, _) = patch(&app, &token, &format!("/orgs/{}", org), json!({"deleted": true})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = patch(&app, &token, &uri, json!({"revoked": false})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}
