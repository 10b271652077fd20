//! # Pulumi Entity Provider
//!
//! One provider per configured Pulumi organization. Once connected to a catalog
//! sink it arms a recurring refresh task; every refresh lists the organization's
//! stacks, fetches and transforms each one, and publishes the resulting entity
//! set as a single full-replacement mutation.

pub mod factory;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::catalog::{
    ANNOTATION_LOCATION, ANNOTATION_ORIGIN_LOCATION, ANNOTATION_SOURCE_LOCATION, DeferredEntity,
    Entity, EntityMutation, EntityProviderConnection, PULUMI_PROJECT_SLUG_ANNOTATION, SinkError,
};
use crate::pulumi::{
    PulumiClient, PulumiClientError, PulumiProviderConfig, ResourceTransformer, StackDetail,
};
use crate::scheduler::{SchedulerError, TaskError, TaskInvocation, TaskRunner};

pub use factory::{
    PROVIDERS_CONFIG_PATH, ProviderBuildError, ProviderDeps, TaskRunnerSource, build_providers,
    read_pulumi_configs,
};

/// Base URL of the Pulumi console; entity locations point here.
pub const PULUMI_CONSOLE_URL: &str = "https://app.pulumi.com";

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("provider {provider} is not connected to a catalog")]
    Uninitialized { provider: String },
    #[error("provider {provider} is already connected")]
    AlreadyConnected { provider: String },
    #[error("failed to list stacks for {provider}: {source}")]
    Listing {
        provider: String,
        source: PulumiClientError,
    },
    #[error("failed to publish entities for {provider}: {source}")]
    Publish { provider: String, source: SinkError },
    #[error("failed to schedule refresh for {provider}: {source}")]
    Schedule {
        provider: String,
        source: SchedulerError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RefreshOutcome {
    Succeeded,
    Failed,
}

/// Outcome of the most recent refresh cycles of one provider.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct RefreshStatus {
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RefreshOutcome>,
    pub last_entity_count: Option<usize>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_task_instance_id: Option<Uuid>,
}

struct ProviderInner {
    config: PulumiProviderConfig,
    provider_name: String,
    client: PulumiClient,
    transformer: Arc<dyn ResourceTransformer>,
    runner: Arc<dyn TaskRunner>,
    connection: RwLock<Option<Arc<dyn EntityProviderConnection>>>,
    span: Span,
    status: RwLock<RefreshStatus>,
}

/// Catalog entity provider for one Pulumi organization. Cheap to clone.
#[derive(Clone)]
pub struct PulumiEntityProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for PulumiEntityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulumiEntityProvider")
            .field("provider_name", &self.inner.provider_name)
            .field("organization", &self.inner.config.organization)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PulumiEntityProvider {
    pub fn new(
        config: PulumiProviderConfig,
        client: PulumiClient,
        transformer: Arc<dyn ResourceTransformer>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        let provider_name = config.provider_name();
        let span = info_span!("pulumi_provider", provider = %provider_name);
        Self {
            inner: Arc::new(ProviderInner {
                config,
                provider_name,
                client,
                transformer,
                runner,
                connection: RwLock::new(None),
                span,
                status: RwLock::new(RefreshStatus::default()),
            }),
        }
    }

    /// `pulumi-provider:{id}`; also the location key of every published entity.
    pub fn provider_name(&self) -> &str {
        &self.inner.provider_name
    }

    pub fn config(&self) -> &PulumiProviderConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.current_connection().is_some()
    }

    pub fn status(&self) -> RefreshStatus {
        self.read_status().clone()
    }

    /// Binds the provider to its catalog sink and arms the recurring refresh task.
    pub async fn connect(
        &self,
        connection: Arc<dyn EntityProviderConnection>,
    ) -> Result<(), RefreshError> {
        {
            let mut slot = self
                .inner
                .connection
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_some() {
                return Err(RefreshError::AlreadyConnected {
                    provider: self.inner.provider_name.clone(),
                });
            }
            *slot = Some(connection);
        }

        let provider = self.clone();
        let task = TaskInvocation::new(self.inner.config.task_id(), move || {
            let provider = provider.clone();
            async move {
                let task_instance_id = Uuid::new_v4();
                let span = info_span!(
                    parent: &provider.inner.span,
                    "refresh",
                    task_instance_id = %task_instance_id
                );
                async {
                    provider
                        .run_refresh(task_instance_id)
                        .await
                        .map_err(|err| Box::new(err) as TaskError)
                }
                .instrument(span)
                .await
                .map(|_| ())
            }
        });

        info!(
            parent: &self.inner.span,
            task_id = %task.id,
            "Connected to catalog"
        );

        match self.inner.runner.run(task).await {
            Ok(()) => Ok(()),
            Err(source) => {
                // Nothing was armed, so the sink is released and connect may be retried.
                if matches!(
                    source,
                    SchedulerError::AlreadyScheduled { .. } | SchedulerError::ShutDown
                ) {
                    *self
                        .inner
                        .connection
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
                }
                Err(RefreshError::Schedule {
                    provider: self.inner.provider_name.clone(),
                    source,
                })
            }
        }
    }

    /// Runs one refresh cycle now and returns the number of published entities.
    pub async fn refresh(&self) -> Result<usize, RefreshError> {
        let task_instance_id = Uuid::new_v4();
        let span = info_span!(
            parent: &self.inner.span,
            "refresh",
            task_instance_id = %task_instance_id
        );
        self.run_refresh(task_instance_id).instrument(span).await
    }

    async fn run_refresh(&self, task_instance_id: Uuid) -> Result<usize, RefreshError> {
        let connection = self
            .current_connection()
            .ok_or_else(|| RefreshError::Uninitialized {
                provider: self.inner.provider_name.clone(),
            })?;

        {
            let mut status = self.write_status();
            status.last_started_at = Some(Utc::now());
            status.last_task_instance_id = Some(task_instance_id);
        }

        info!("Discovering Pulumi stacks");
        let started = Instant::now();
        let result = self.collect_and_publish(connection.as_ref()).await;
        let elapsed = started.elapsed();

        let labels = vec![("provider", self.inner.provider_name.clone())];
        histogram!("pulumi_refresh_duration_ms", &labels).record(elapsed.as_secs_f64() * 1_000.0);

        let mut status = self.write_status();
        status.last_finished_at = Some(Utc::now());
        match &result {
            Ok(count) => {
                counter!("pulumi_refresh_total", "provider" => self.inner.provider_name.clone(), "outcome" => "success")
                    .increment(1);
                gauge!("pulumi_refresh_entities", &labels).set(*count as f64);
                status.last_outcome = Some(RefreshOutcome::Succeeded);
                status.last_entity_count = Some(*count);
                status.last_error = None;
                status.consecutive_failures = 0;
            }
            Err(err) => {
                error!(error = %err, "Refresh failed");
                counter!("pulumi_refresh_total", "provider" => self.inner.provider_name.clone(), "outcome" => "failure")
                    .increment(1);
                status.last_outcome = Some(RefreshOutcome::Failed);
                status.last_error = Some(err.to_string());
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            }
        }

        result
    }

    async fn collect_and_publish(
        &self,
        connection: &dyn EntityProviderConnection,
    ) -> Result<usize, RefreshError> {
        let inner = &self.inner;
        let page = inner
            .client
            .list_stacks()
            .await
            .map_err(|source| RefreshError::Listing {
                provider: inner.provider_name.clone(),
                source,
            })?;

        if let Some(token) = page.continuation_token.as_deref() {
            debug!(
                continuation_token = token,
                "Stack listing has further pages; only the first page is read"
            );
        }

        let mut entities = Vec::with_capacity(page.stacks.len());
        let mut published_by: HashMap<String, String> = HashMap::new();
        for summary in &page.stacks {
            let slug = summary.slug();
            let detail = match inner
                .client
                .get_stack_detail(&summary.org_name, &summary.project_name, &summary.stack_name)
                .await
            {
                Ok(Some(detail)) => detail,
                Ok(None) => {
                    warn!(stack = %slug, "Stack not found, skipping");
                    self.count_skipped("not_found");
                    continue;
                }
                Err(err) => {
                    warn!(stack = %slug, error = %err, "Failed to fetch stack detail, skipping");
                    self.count_skipped("fetch_failed");
                    continue;
                }
            };

            match inner.transformer.transform(&detail, &inner.config).await {
                Ok(Some(entity)) => {
                    let entity_ref = entity.entity_ref();
                    if let Some(first) = published_by.get(&entity_ref) {
                        warn!(
                            stack = %slug,
                            kept_stack = %first,
                            entity_ref = %entity_ref,
                            "Stack maps to an entity already produced by another stack, skipping"
                        );
                        self.count_skipped("duplicate_entity");
                        continue;
                    }
                    published_by.insert(entity_ref, slug.clone());
                    let entity = with_locations(PULUMI_CONSOLE_URL, entity, &detail);
                    entities.push(DeferredEntity::new(entity, inner.provider_name.clone()));
                }
                Ok(None) => {
                    debug!(stack = %slug, "Transformer declined stack");
                }
                Err(err) => {
                    warn!(stack = %slug, error = %err, "Failed to transform stack, skipping");
                    self.count_skipped("transform_failed");
                }
            }
        }

        let count = entities.len();
        connection
            .apply_mutation(EntityMutation::full(entities))
            .await
            .map_err(|source| RefreshError::Publish {
                provider: inner.provider_name.clone(),
                source,
            })?;

        info!(
            stacks = page.stacks.len(),
            entities = count,
            "Published Pulumi entities"
        );
        Ok(count)
    }

    fn current_connection(&self) -> Option<Arc<dyn EntityProviderConnection>> {
        self.inner
            .connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn count_skipped(&self, reason: &'static str) {
        counter!(
            "pulumi_stacks_skipped_total",
            "provider" => self.inner.provider_name.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    fn read_status(&self) -> RwLockReadGuard<'_, RefreshStatus> {
        self.inner
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, RefreshStatus> {
        self.inner
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Adds the managed-by and source location annotations pointing at the stack's
/// page in the Pulumi console. Annotations already present are kept as is.
pub fn with_locations(base_url: &str, mut entity: Entity, detail: &StackDetail) -> Entity {
    let slug = entity
        .annotation(PULUMI_PROJECT_SLUG_ANNOTATION)
        .map(str::to_string)
        .unwrap_or_else(|| detail.slug());
    let location = format!("url:{}/{}", base_url.trim_end_matches('/'), slug);

    for key in [
        ANNOTATION_LOCATION,
        ANNOTATION_ORIGIN_LOCATION,
        ANNOTATION_SOURCE_LOCATION,
    ] {
        entity
            .metadata
            .annotations
            .entry(key.to_string())
            .or_insert_with(|| location.clone());
    }
    entity
}
