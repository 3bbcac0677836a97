use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::lifecycle::BatchFailure;
use crate::models;
use crate::routes::health::HealthResponse;

#[derive(OpenApi)]
#[openapi(
	paths(
		crate::routes::auth::register,
		crate::routes::auth::login,
		crate::routes::auth::me,
		crate::routes::auth::logout,
		crate::routes::users::get_user,
		crate::routes::users::patch_user,
		crate::routes::users::patch_users_batch,
		crate::routes::organizations::create_organization,
		crate::routes::organizations::list_organizations,
		crate::routes::organizations::get_organization,
		crate::routes::organizations::patch_organization,
		crate::routes::organizations::patch_organizations_batch,
		crate::routes::memberships::list_memberships,
		crate::routes::memberships::create_membership,
		crate::routes::memberships::patch_membership,
		crate::routes::memberships::patch_memberships_batch,
		crate::routes::roles::list_roles,
		crate::routes::roles::create_role,
		crate::routes::roles::update_role,
		crate::routes::roles::delete_role,
		crate::routes::packages::list_packages,
		crate::routes::packages::create_package,
		crate::routes::packages::get_package,
		crate::routes::packages::patch_package,
		crate::routes::packages::patch_packages_batch,
		crate::routes::packages::list_versions,
		crate::routes::packages::create_version,
		crate::routes::packages::patch_version,
		crate::routes::packages::patch_versions_batch,
		crate::routes::packages::record_download,
		crate::routes::packages::list_downloads,
		crate::routes::billing::get_billing,
		crate::routes::billing::put_billing,
		crate::routes::health::health
	),
	components(
		schemas(
			models::user::User,
			models::user::AuthResponse,
			models::user::LoginRequest,
			models::user::RegisterRequest,
			models::user::UserDeltaRequest,
			models::user::UserBatchItem,
			models::user::UserBatchRequest,
			models::organization::Organization,
			models::organization::OrganizationCreateRequest,
			models::organization::OrganizationDeltaRequest,
			models::organization::OrganizationBatchItem,
			models::organization::OrganizationBatchRequest,
			models::membership::Membership,
			models::membership::MembershipCreateRequest,
			models::membership::MembershipDeltaRequest,
			models::membership::MembershipBatchItem,
			models::membership::MembershipBatchRequest,
			models::role::Role,
			models::role::RoleCreateRequest,
			models::role::RoleUpdateRequest,
			models::package::Package,
			models::package::PackageVersion,
			models::package::PackageCreateRequest,
			models::package::PackageVersionCreateRequest,
			models::package::ArchiveDeltaRequest,
			models::package::ArchiveBatchItem,
			models::package::PackageBatchRequest,
			models::package::PackageVersionBatchRequest,
			models::package::PackageDownload,
			models::billing::BillingProfile,
			models::billing::BillingUpdateRequest,
			BatchFailure,
			HealthResponse
		)
	),
	tags(
		(name = "Auth", description = "Authentication endpoints"),
		(name = "Users", description = "User lifecycle"),
		(name = "Organizations", description = "Organization lifecycle"),
		(name = "Memberships", description = "Membership lifecycle"),
		(name = "Roles", description = "Role management"),
		(name = "Packages", description = "Package and version lifecycle"),
		(name = "Billing", description = "Billing profile"),
		(name = "Health", description = "Service health")
	)
)]
pub struct ApiDoc;

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(&ApiDoc::openapi())?;

	normalize_path_operations(&mut doc);
	ensure_security_components(&mut doc);
	ensure_global_security(&mut doc);
	ensure_openapi_version(&mut doc);
	add_examples(&mut doc);
	ensure_servers(&mut doc, port);

	Ok(serde_json::from_value(doc)?)
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> Router {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.with_credentials(true)
		.persist_authorization(true);

	let doc_json = Arc::new(serde_json::to_value(&doc).expect("OpenAPI serialization must succeed"));

	let json_route = {
		let doc_json = Arc::clone(&doc_json);
		get(move || {
			let doc_json = Arc::clone(&doc_json);
			async move { Json((*doc_json).clone()) }
		})
	};

	Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config))
}

fn normalize_path_operations(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		let snapshot = paths.clone();
		for (path, item) in snapshot {
			if let Some(ops) = item.as_object() {
				let mut normalized = Map::new();
				for (method, val) in ops {
					let key = method.to_lowercase();
					if let Some(existing) = normalized.get_mut(&key) {
						merge_values(existing, val);
					} else {
						normalized.insert(key, val.clone());
					}
				}
				paths.insert(path, Value::Object(normalized));
			}
		}
	}
}

fn ensure_security_components(doc: &mut Value) {
	let components = doc
		.as_object_mut()
		.expect("OpenAPI root must be an object")
		.entry("components")
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
		.expect("components must be an object");

	let schemes = components
		.entry("securitySchemes")
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
		.expect("securitySchemes must be an object");

	schemes.insert(
		"bearerAuth".to_string(),
		json!({
			"type": "http",
			"scheme": "bearer",
			"bearerFormat": "JWT"
		}),
	);
}

fn ensure_global_security(doc: &mut Value) {
	doc
		.as_object_mut()
		.expect("OpenAPI root must be an object")
		.entry("security")
		.or_insert_with(|| json!([{ "bearerAuth": [] }]));
}

fn ensure_openapi_version(doc: &mut Value) {
	doc
		.as_object_mut()
		.expect("OpenAPI root must be an object")
		.entry("openapi")
		.or_insert_with(|| Value::String("3.1.0".to_string()));
}

fn add_examples(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		for item in paths.values_mut() {
			if let Some(operations) = item.as_object_mut() {
				for operation in operations.values_mut() {
					apply_request_examples(operation);
				}
			}
		}
	}
}

fn apply_request_examples(operation: &mut Value) {
	let Some(request_body) = operation.get_mut("requestBody") else { return; };
	let Some(content) = request_body.get_mut("content").and_then(Value::as_object_mut) else { return; };
	let Some(app_json) = content.get_mut("application/json").and_then(Value::as_object_mut) else { return; };
	let Some(schema) = app_json.get("schema").and_then(Value::as_object) else { return; };
	let Some(reference) = schema.get("$ref").and_then(Value::as_str) else { return; };

	let example = match reference {
		"#/components/schemas/LoginRequest" => Some(json!({
			"email": "ada@example.com",
			"password": "S3cureP@ssw0rd"
		})),
		"#/components/schemas/RegisterRequest" => Some(json!({
			"name": "Ada Lovelace",
			"email": "ada@example.com",
			"password": "S3cureP@ssw0rd"
		})),
		"#/components/schemas/OrganizationCreateRequest" => Some(json!({
			"name": "acme"
		})),
		"#/components/schemas/MembershipCreateRequest" => Some(json!({
			"user_id": "00000000-0000-0000-0000-000000000000",
			"role_id": "a0000000-0000-4000-8000-000000000003"
		})),
		"#/components/schemas/MembershipDeltaRequest" => Some(json!({
			"role_id": "a0000000-0000-4000-8000-000000000002",
			"revoked": false
		})),
		"#/components/schemas/ArchiveDeltaRequest" => Some(json!({
			"archived": true
		})),
		"#/components/schemas/RoleCreateRequest" => Some(json!({
			"name": "Release Engineer",
			"description": "Can publish versions but not create packages",
			"permissions": ["read:packages", "write:versions"]
		})),
		_ => None,
	};

	if let Some(example) = example {
		app_json.insert("example".to_string(), example);
	}
}

fn ensure_servers(doc: &mut Value, port: u16) {
	// Prefer https when the server will terminate TLS itself, so Swagger's
	// Try-it-out calls the right scheme.
	let tls_enabled = std::env::var("CERT_PATH").is_ok() && std::env::var("KEY_PATH").is_ok();

	let scheme = if tls_enabled { "https" } else { "http" };
	let server_url = format!("{}://localhost:{}", scheme, port);

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr.iter().any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

fn merge_values(target: &mut Value, addition: &Value) {
	match (target, addition) {
		(Value::Object(dest), Value::Object(src)) => {
			for (key, value) in src {
				if let Some(existing) = dest.get_mut(key) {
					merge_values(existing, value);
				} else {
					dest.insert(key.clone(), value.clone());
				}
			}
		}
		(Value::Array(dest), Value::Array(src)) => {
			for item in src {
				if !dest.contains(item) {
					dest.push(item.clone());
				}
			}
		}
		_ => {}
	}
}
