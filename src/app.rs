use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, patch, post, put};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{Authorizer, CacheConfig};
use crate::errors::AppError;
use crate::events::{init_event_bus, start_activity_listener, EventBus};
use crate::jwt::JwtConfig;
use crate::routes::{auth, billing, health, memberships, organizations, packages, roles, users};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub event_bus: EventBus,
    pub authz: Authorizer,
}

impl AppState {
    pub fn new(pool: SqlitePool, jwt: JwtConfig, event_bus: EventBus, authz: Authorizer) -> Self {
        Self {
            pool,
            jwt: Arc::new(jwt),
            event_bus,
            authz,
        }
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let authz = Authorizer::from_pool(pool.clone(), CacheConfig::from_env()?);

    let (event_bus, event_rx) = init_event_bus();
    tokio::spawn(start_activity_listener(event_rx, pool.clone()));

    let state = AppState::new(pool, jwt_config, event_bus, authz);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/me", get(auth::me))
        .route("/logout", post(auth::logout));

    let user_routes = Router::new()
        .route("/batch", patch(users::patch_users_batch))
        .route("/:id", get(users::get_user).patch(users::patch_user));

    let org_routes = Router::new()
        .route("/", get(organizations::list_organizations).post(organizations::create_organization))
        .route("/batch", patch(organizations::patch_organizations_batch))
        .route("/:org_id", get(organizations::get_organization).patch(organizations::patch_organization))
        // membership lifecycle
        .route(
            "/:org_id/memberships",
            get(memberships::list_memberships).post(memberships::create_membership),
        )
        .route("/:org_id/memberships/batch", patch(memberships::patch_memberships_batch))
        .route("/:org_id/memberships/:membership_id", patch(memberships::patch_membership))
        // roles
        .route("/:org_id/roles", get(roles::list_roles).post(roles::create_role))
        .route("/:org_id/roles/:role_id", put(roles::update_role).delete(roles::delete_role))
        // packages and versions
        .route("/:org_id/packages", get(packages::list_packages).post(packages::create_package))
        .route("/:org_id/packages/batch", patch(packages::patch_packages_batch))
        .route(
            "/:org_id/packages/:package_id",
            get(packages::get_package).patch(packages::patch_package),
        )
        .route(
            "/:org_id/packages/:package_id/versions",
            get(packages::list_versions).post(packages::create_version),
        )
        .route(
            "/:org_id/packages/:package_id/versions/batch",
            patch(packages::patch_versions_batch),
        )
        .route(
            "/:org_id/packages/:package_id/versions/:version_id",
            patch(packages::patch_version),
        )
        .route(
            "/:org_id/packages/:package_id/versions/:version_id/download",
            post(packages::record_download),
        )
        .route(
            "/:org_id/packages/:package_id/versions/:version_id/downloads",
            get(packages::list_downloads),
        )
        // billing
        .route("/:org_id/billing", get(billing::get_billing).put(billing::put_billing));

    let router = Router::new()
        .route("/api/health", get(health::health))
        .nest("/auth", auth_routes)
        .nest("/users", user_routes)
        .nest("/orgs", org_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(router)
}
