//! # API Handlers
//!
//! Read-only endpoints over the in-memory catalog and the configured providers.

use axum::{
    extract::{Path, Query, State, rejection::QueryRejection},
    response::Json,
};
use serde_json::json;

use crate::error::{ApiError, not_found, validation_error};
use crate::models::{
    EntitiesQuery, EntityListResponse, HealthResponse, ProviderInfo, ProviderListResponse,
    ServiceInfo,
};
use crate::server::AppState;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is running", body = HealthResponse)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        entities: state.catalog.len(),
        providers: state.providers.len(),
    })
}

/// Lists catalog entities, optionally restricted to one location key.
#[utoipa::path(
    get,
    path = "/entities",
    params(EntitiesQuery),
    responses(
        (status = 200, description = "Catalog entities", body = EntityListResponse),
        (status = 400, description = "Invalid query", body = ApiError)
    ),
    tag = "catalog"
)]
pub async fn list_entities(
    State(state): State<AppState>,
    query: Result<Query<EntitiesQuery>, QueryRejection>,
) -> Result<Json<EntityListResponse>, ApiError> {
    let Query(query) = query?;

    let items = match query.location_key.as_deref() {
        Some("") => {
            return Err(validation_error(
                "location_key must not be empty",
                json!({ "location_key": "must not be empty" }),
            ));
        }
        Some(location_key) => state.catalog.entities_for_location_key(location_key),
        None => state.catalog.entities(),
    };

    Ok(Json(EntityListResponse {
        total: items.len(),
        items,
    }))
}

#[utoipa::path(
    get,
    path = "/providers",
    responses(
        (status = 200, description = "Configured providers and their refresh status", body = ProviderListResponse)
    ),
    tag = "providers"
)]
pub async fn list_providers(State(state): State<AppState>) -> Json<ProviderListResponse> {
    Json(ProviderListResponse {
        providers: state.providers.iter().map(ProviderInfo::from).collect(),
    })
}

#[utoipa::path(
    get,
    path = "/providers/{name}",
    params(
        ("name" = String, Path, description = "Provider name, e.g. pulumi-provider:prod")
    ),
    responses(
        (status = 200, description = "Provider and its refresh status", body = ProviderInfo),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn get_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProviderInfo>, ApiError> {
    state
        .providers
        .iter()
        .find(|provider| provider.provider_name() == name)
        .map(|provider| Json(ProviderInfo::from(provider)))
        .ok_or_else(|| not_found(&format!("Provider '{name}' is not configured")))
}
