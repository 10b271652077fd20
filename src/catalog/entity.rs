//! Catalog entity descriptor
//!
//! Follows the Backstage descriptor format: `apiVersion`, `kind`, `metadata` and
//! a kind-specific `spec`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_API_VERSION: &str = "backstage.io/v1alpha1";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const RESOURCE_KIND: &str = "Resource";

/// Location the entity is managed by.
pub const ANNOTATION_LOCATION: &str = "backstage.io/managed-by-location";
/// Location that first introduced the entity.
pub const ANNOTATION_ORIGIN_LOCATION: &str = "backstage.io/managed-by-origin-location";
/// Where the entity's source lives.
pub const ANNOTATION_SOURCE_LOCATION: &str = "backstage.io/source-location";
/// `owner/repo` of the GitHub repository backing the stack.
pub const GITHUB_PROJECT_SLUG_ANNOTATION: &str = "github.com/project-slug";
/// `org/project/stack` of the Pulumi stack.
pub const PULUMI_PROJECT_SLUG_ANNOTATION: &str = "pulumi.com/project-slug";
/// Pulumi organization owning the stack.
pub const PULUMI_ORGA_SLUG_ANNOTATION: &str = "pulumi.com/orga-slug";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            title: None,
            description: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            tags: Vec::new(),
        }
    }
}

/// `spec` of a `Resource` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub api_version: String,
    pub kind: String,
    pub metadata: EntityMetadata,
    #[schema(value_type = Object)]
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Entity {
    /// Builds a `Resource` entity.
    pub fn resource(metadata: EntityMetadata, spec: ResourceSpec) -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            kind: RESOURCE_KIND.to_string(),
            metadata,
            spec: serde_json::to_value(spec).unwrap_or_default(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// `kind:namespace/name`, lower-cased; the catalog identity of the entity.
    pub fn entity_ref(&self) -> String {
        format!("{}:{}/{}", self.kind, self.namespace(), self.metadata.name).to_lowercase()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}
