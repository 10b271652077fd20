//! In-process catalog sink.
//!
//! Keeps every published entity in memory, grouped by the provider that owns it.
//! Each provider publishes through its own [`CatalogConnection`]; an entity ref
//! owned by one provider is never taken over by another.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use metrics::gauge;
use tracing::{debug, warn};

use super::{
    ANNOTATION_SOURCE_LOCATION, DeferredEntity, EntityMutation, EntityProviderConnection,
    SinkError,
};

type ProviderEntities = BTreeMap<String, DeferredEntity>;

#[derive(Debug, Default)]
struct CatalogState {
    /// provider name -> entity ref -> entity
    providers: BTreeMap<String, ProviderEntities>,
}

impl CatalogState {
    fn owner_of(&self, entity_ref: &str) -> Option<&str> {
        self.providers
            .iter()
            .find(|(_, entities)| entities.contains_key(entity_ref))
            .map(|(provider, _)| provider.as_str())
    }

    fn total(&self) -> usize {
        self.providers.values().map(BTreeMap::len).sum()
    }
}

/// Shared in-memory catalog. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<RwLock<CatalogState>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink scoped to `provider_name`.
    pub fn connection(&self, provider_name: impl Into<String>) -> Arc<CatalogConnection> {
        Arc::new(CatalogConnection {
            provider_name: provider_name.into(),
            catalog: self.clone(),
        })
    }

    /// Every entity in the catalog, ordered by provider then entity ref.
    pub fn entities(&self) -> Vec<DeferredEntity> {
        let state = self.read();
        state
            .providers
            .values()
            .flat_map(|entities| entities.values().cloned())
            .collect()
    }

    pub fn entities_for_location_key(&self, location_key: &str) -> Vec<DeferredEntity> {
        let state = self.read();
        state
            .providers
            .values()
            .flat_map(|entities| entities.values())
            .filter(|deferred| deferred.location_key.as_deref() == Some(location_key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, provider_name: &str, mutation: EntityMutation) -> Result<(), SinkError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| SinkError::Unavailable("catalog lock poisoned".to_string()))?;

        match mutation {
            EntityMutation::Full { entities } => {
                let mut replacement = ProviderEntities::new();
                for deferred in entities {
                    let entity_ref = deferred.entity.entity_ref();
                    if let Some(owner) = state
                        .owner_of(&entity_ref)
                        .filter(|owner| *owner != provider_name)
                    {
                        warn!(
                            provider = provider_name,
                            owner,
                            entity_ref = %entity_ref,
                            "Skipping entity owned by another provider"
                        );
                        continue;
                    }
                    if let Some(kept) = replacement.get(&entity_ref) {
                        warn!(
                            provider = provider_name,
                            entity_ref = %entity_ref,
                            kept_location = kept.entity.annotation(ANNOTATION_SOURCE_LOCATION),
                            dropped_location =
                                deferred.entity.annotation(ANNOTATION_SOURCE_LOCATION),
                            "Duplicate entity in full mutation, keeping the first"
                        );
                        continue;
                    }
                    replacement.insert(entity_ref, deferred);
                }

                let previous = state
                    .providers
                    .insert(provider_name.to_string(), replacement)
                    .map(|entities| entities.len())
                    .unwrap_or(0);
                debug!(
                    provider = provider_name,
                    previous,
                    current = state.providers.get(provider_name).map_or(0, BTreeMap::len),
                    "Applied full mutation"
                );
            }
            EntityMutation::Delta { added, removed } => {
                for deferred in added {
                    let entity_ref = deferred.entity.entity_ref();
                    if let Some(owner) = state
                        .owner_of(&entity_ref)
                        .filter(|owner| *owner != provider_name)
                    {
                        warn!(
                            provider = provider_name,
                            owner,
                            entity_ref = %entity_ref,
                            "Skipping entity owned by another provider"
                        );
                        continue;
                    }
                    state
                        .providers
                        .entry(provider_name.to_string())
                        .or_default()
                        .insert(entity_ref, deferred);
                }

                if let Some(entities) = state.providers.get_mut(provider_name) {
                    for removal in removed {
                        entities.remove(&removal.entity_ref.to_lowercase());
                    }
                }
            }
        }

        gauge!("catalog_entities").set(state.total() as f64);
        Ok(())
    }
}

/// Publish handle bound to one provider.
#[derive(Debug)]
pub struct CatalogConnection {
    provider_name: String,
    catalog: InMemoryCatalog,
}

impl CatalogConnection {
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }
}

#[async_trait]
impl EntityProviderConnection for CatalogConnection {
    async fn apply_mutation(&self, mutation: EntityMutation) -> Result<(), SinkError> {
        self.catalog.apply(&self.provider_name, mutation)
    }
}
