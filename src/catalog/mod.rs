//! Catalog model and publish sink
//!
//! Entity providers hand their output to an [`EntityProviderConnection`] as an
//! [`EntityMutation`]. A `Full` mutation declares the complete entity set of the
//! provider; anything it published before and omits now is removed.

pub mod entity;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub use entity::{
    ANNOTATION_LOCATION, ANNOTATION_ORIGIN_LOCATION, ANNOTATION_SOURCE_LOCATION,
    DEFAULT_NAMESPACE, Entity, EntityMetadata, GITHUB_PROJECT_SLUG_ANNOTATION,
    PULUMI_ORGA_SLUG_ANNOTATION, PULUMI_PROJECT_SLUG_ANNOTATION, ResourceSpec,
};
pub use memory::InMemoryCatalog;

/// Entity paired with the location key it is published under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeferredEntity {
    pub entity: Entity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_key: Option<String>,
}

impl DeferredEntity {
    pub fn new(entity: Entity, location_key: impl Into<String>) -> Self {
        Self {
            entity,
            location_key: Some(location_key.into()),
        }
    }
}

/// Reference to an entity removed by a delta mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedEntity {
    pub entity_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntityMutation {
    /// Replace everything previously published by this provider.
    Full { entities: Vec<DeferredEntity> },
    /// Upsert `added` and remove `removed`, leaving other entities untouched.
    Delta {
        added: Vec<DeferredEntity>,
        removed: Vec<RemovedEntity>,
    },
}

impl EntityMutation {
    pub fn full(entities: Vec<DeferredEntity>) -> Self {
        EntityMutation::Full { entities }
    }

    pub fn len(&self) -> usize {
        match self {
            EntityMutation::Full { entities } => entities.len(),
            EntityMutation::Delta { added, removed } => added.len() + removed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors raised by a catalog sink when it rejects a mutation.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("catalog rejected mutation: {0}")]
    Rejected(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Handle through which one provider publishes to the catalog.
#[async_trait]
pub trait EntityProviderConnection: Send + Sync {
    async fn apply_mutation(&self, mutation: EntityMutation) -> Result<(), SinkError>;
}
