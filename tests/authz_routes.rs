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

fn token_for(user: Uuid, operator: bool) -> String {
    let jwt = JwtConfig {
        secret: Arc::new(b"test_secret".to_vec()),
        exp_hours: 1,
    };
    jwt.encode(user, operator).unwrap()
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

#[sqlx::test]
async fn denials_distinguish_outsiders_from_underprivileged_members(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let user_role = global_role_id(&pool, "User").await;
    let reader = insert_user(&pool, "reader@example.com").await;
    let outsider = insert_user(&pool, "outsider@example.com").await;
    let org = insert_org(&pool, "acme").await;
    insert_membership(&pool, reader, org, user_role).await;

    // A member with the consumer role can read packages but not create them.
    let (status, _) = send(&app, "GET", &format!("/orgs/{}/packages", org), &token_for(reader, false), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/orgs/{}/packages", org),
        &token_for(reader, false),
        Some(json!({"name": "left-pad"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "missing_permission");

    // A non-member is denied with the distinct no-membership reason.
    let (status, body) = send(
        &app,
        "GET",
        &format!("/orgs/{}/packages", org),
        &token_for(outsider, false),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "no_membership");
}

#[sqlx::test]
async fn system_operator_bypasses_organization_checks(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let org = insert_org(&pool, "acme").await;
    let operator = insert_user(&pool, "op@example.com").await;

    // No membership anywhere, yet every organization-scoped check passes.
    let (status, _) = send(
        &app,
        "GET",
        &format!("/orgs/{}/packages", org),
        &token_for(operator, true),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/orgs/{}/packages", org),
        &token_for(operator, true),
        Some(json!({"name": "left-pad"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[sqlx::test]
async fn custom_roles_enforce_catalog_and_naming_constraints(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let admin_role = global_role_id(&pool, "Administrator").await;
    let admin = insert_user(&pool, "admin@example.com").await;
    let org = insert_org(&pool, "acme").await;
    insert_membership(&pool, admin, org, admin_role).await;
    let token = token_for(admin, false);
    let uri = format!("/orgs/{}/roles", org);

    // Reserved names are rejected.
    let (status, body) = send(
        &app,
        "POST",
        &uri,
        &token,
        Some(json!({"name": "Administrator", "permissions": ["read:packages"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "constraint_violation");

    // Tokens outside the catalog are rejected.
    let (status, body) = send(
        &app,
        "POST",
        &uri,
        &token,
        Some(json!({"name": "Weird", "permissions": ["write:everything"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    // A valid custom role can be assigned and then protected from deletion.
    let (status, role) = send(
        &app,
        "POST",
        &uri,
        &token,
        Some(json!({"name": "Release Engineer", "permissions": ["read:packages", "write:versions"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let role_id = Uuid::parse_str(role["id"].as_str().unwrap()).unwrap();

    let member = insert_user(&pool, "member@example.com").await;
    insert_membership(&pool, member, org, role_id).await;

    let (status, body) = send(&app, "DELETE", &format!("{}/{}", uri, role_id), &token, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "constraint_violation");
}

#[sqlx::test]
async fn global_roles_cannot_be_modified_or_deleted(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let admin_role = global_role_id(&pool, "Administrator").await;
    let admin = insert_user(&pool, "admin@example.com").await;
    let org = insert_org(&pool, "acme").await;
    insert_membership(&pool, admin, org, admin_role).await;
    let token = token_for(admin, false);

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/orgs/{}/roles/{}", org, admin_role),
        &token,
        Some(json!({"description": "weakened"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "constraint_violation");

    let (status, _) = send(&app, "DELETE", &format!("/orgs/{}/roles/{}", org, admin_role), &token, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[sqlx::test]
async fn role_grants_are_resolved_through_the_membership(pool: SqlitePool) {
    std::env::set_var("JWT_SECRET", "test_secret");
    let app = parcelhub::create_app(pool.clone()).await.unwrap();

    let billing_role = global_role_id(&pool, "Billing Manager").await;
    let biller = insert_user(&pool, "biller@example.com").await;
    let org = insert_org(&pool, "acme").await;
    insert_membership(&pool, biller, org, billing_role).await;
    let token = token_for(biller, false);

    // Billing Manager can write billing but not packages.
    let (status, _) = send(
        &app,
        "PUT",
        &format!("/orgs/{}/billing", org),
        &token,
        Some(json!({"email": "billing@acme.example", "plan": "team"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/orgs/{}/packages", org),
        &token,
        Some(json!({"name": "left-pad"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "missing_permission");

    let (status, profile) = send(&app, "GET", &format!("/orgs/{}/billing", org), &token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["plan"], "team");
}
