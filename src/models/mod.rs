//! # Data Models
//!
//! Response and query types of the status API.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::catalog::DeferredEntity;
use crate::provider::{PulumiEntityProvider, RefreshStatus};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "pulumi-catalog".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Number of entities currently held by the catalog.
    pub entities: usize,
    pub providers: usize,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EntitiesQuery {
    /// Only return entities published under this location key, e.g. `pulumi-provider:prod`.
    pub location_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EntityListResponse {
    pub total: usize,
    pub items: Vec<DeferredEntity>,
}

/// One configured provider and the outcome of its latest refresh.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderInfo {
    /// `pulumi-provider:{id}`
    pub name: String,
    pub organization: String,
    pub api: String,
    pub connected: bool,
    pub status: RefreshStatus,
}

impl From<&PulumiEntityProvider> for ProviderInfo {
    fn from(provider: &PulumiEntityProvider) -> Self {
        let config = provider.config();
        Self {
            name: provider.provider_name().to_string(),
            organization: config.organization.clone(),
            api: config.api.clone(),
            connected: provider.is_connected(),
            status: provider.status(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderListResponse {
    pub providers: Vec<ProviderInfo>,
}
