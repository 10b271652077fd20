//! Builds one [`PulumiEntityProvider`] per entry under `catalog.providers.pulumi`.
//!
//! Building never performs network calls and never spawns tasks; the first
//! configuration error aborts the whole build.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use super::PulumiEntityProvider;
use crate::config::{ConfigReadError, ConfigReader, ScheduleDefinition, read_schedule_definition};
use crate::pulumi::{
    AccessToken, DefaultResourceTransformer, PulumiClient, PulumiClientError,
    PulumiProviderConfig, ResourceTransformer, parse_base_url,
};
use crate::scheduler::{TaskRunner, TaskScheduler};

/// Location of the provider map in the configuration document.
pub const PROVIDERS_CONFIG_PATH: &str = "catalog.providers.pulumi";

const TOKEN_KEY: &str = "pulumiAccessToken";
const TOKEN_ALIAS_KEY: &str = "accessToken";

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProviderBuildError {
    #[error("either a task runner or a scheduler must be provided")]
    MissingRunner,
    #[error(
        "no schedule for Pulumi provider '{id}': set catalog.providers.pulumi.{id}.schedule or a default schedule"
    )]
    MissingSchedule { id: String },
    #[error(transparent)]
    Config(#[from] ConfigReadError),
    #[error("invalid API url for Pulumi provider '{id}': {source}")]
    InvalidApi {
        id: String,
        source: PulumiClientError,
    },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Collaborators handed to [`build_providers`].
#[derive(Clone, Default)]
pub struct ProviderDeps {
    /// Runner used for every provider; takes precedence over `scheduler`.
    pub schedule: Option<Arc<dyn TaskRunner>>,
    pub scheduler: Option<TaskScheduler>,
    /// Schedule for providers that do not declare one.
    pub default_schedule: Option<ScheduleDefinition>,
    pub transformer: Option<Arc<dyn ResourceTransformer>>,
    pub http_client: Option<reqwest::Client>,
}

/// Where each provider's task runner comes from, resolved once per build.
#[derive(Clone)]
pub enum TaskRunnerSource {
    ExplicitRunner(Arc<dyn TaskRunner>),
    SchedulerWithDefinition {
        scheduler: TaskScheduler,
        default_schedule: Option<ScheduleDefinition>,
    },
}

impl TaskRunnerSource {
    pub fn resolve(
        runner: Option<Arc<dyn TaskRunner>>,
        scheduler: Option<TaskScheduler>,
        default_schedule: Option<ScheduleDefinition>,
    ) -> Result<Self, ProviderBuildError> {
        match (runner, scheduler) {
            (Some(runner), _) => Ok(TaskRunnerSource::ExplicitRunner(runner)),
            (None, Some(scheduler)) => Ok(TaskRunnerSource::SchedulerWithDefinition {
                scheduler,
                default_schedule,
            }),
            (None, None) => Err(ProviderBuildError::MissingRunner),
        }
    }

    /// Runner for one provider: the explicit runner, or a scheduled runner using
    /// the provider's own schedule, falling back to the default schedule.
    pub fn runner_for(
        &self,
        config: &PulumiProviderConfig,
    ) -> Result<Arc<dyn TaskRunner>, ProviderBuildError> {
        match self {
            TaskRunnerSource::ExplicitRunner(runner) => Ok(runner.clone()),
            TaskRunnerSource::SchedulerWithDefinition {
                scheduler,
                default_schedule,
            } => {
                let schedule = config
                    .schedule
                    .clone()
                    .or_else(|| default_schedule.clone())
                    .ok_or_else(|| ProviderBuildError::MissingSchedule {
                        id: config.id.clone(),
                    })?;
                Ok(Arc::new(scheduler.create_scheduled_task_runner(schedule)))
            }
        }
    }
}

/// Reads and validates every provider entry. An absent section yields no providers.
pub fn read_pulumi_configs(
    root: &ConfigReader,
) -> Result<Vec<PulumiProviderConfig>, ProviderBuildError> {
    let Some(section) = root.get_optional_config(PROVIDERS_CONFIG_PATH)? else {
        return Ok(Vec::new());
    };

    section
        .keys()
        .into_iter()
        .map(|id| {
            let entry = section.child(&id)?;
            read_provider_config(id, &entry)
        })
        .collect()
}

fn read_provider_config(
    id: String,
    entry: &ConfigReader,
) -> Result<PulumiProviderConfig, ProviderBuildError> {
    let api = required_string(entry, "api")?;
    parse_base_url(&api).map_err(|source| ProviderBuildError::InvalidApi {
        id: id.clone(),
        source,
    })?;
    let organization = required_string(entry, "organization")?;

    let token_key = if entry.has(TOKEN_KEY) {
        TOKEN_KEY
    } else if entry.has(TOKEN_ALIAS_KEY) {
        TOKEN_ALIAS_KEY
    } else {
        return Err(ConfigReadError::Missing {
            key: entry.full_key(TOKEN_KEY),
        }
        .into());
    };
    let access_token = AccessToken::new(required_string(entry, token_key)?);

    let schedule = entry
        .get_optional_config("schedule")?
        .map(|schedule| read_schedule_definition(&schedule))
        .transpose()?;

    Ok(PulumiProviderConfig {
        id,
        api,
        organization,
        access_token,
        schedule,
    })
}

fn required_string(entry: &ConfigReader, key: &str) -> Result<String, ConfigReadError> {
    let value = entry.get_string(key)?;
    if value.trim().is_empty() {
        return Err(ConfigReadError::Invalid {
            key: entry.full_key(key),
            message: "must not be empty".to_string(),
        });
    }
    Ok(value)
}

/// Builds the providers declared under `catalog.providers.pulumi`.
pub fn build_providers(
    config: &ConfigReader,
    deps: ProviderDeps,
) -> Result<Vec<PulumiEntityProvider>, ProviderBuildError> {
    let source = TaskRunnerSource::resolve(deps.schedule, deps.scheduler, deps.default_schedule)?;
    let configs = read_pulumi_configs(config)?;

    let transformer = deps
        .transformer
        .unwrap_or_else(|| Arc::new(DefaultResourceTransformer) as Arc<dyn ResourceTransformer>);
    let http = match deps.http_client {
        Some(client) => client,
        None => PulumiClient::http_client(DEFAULT_HTTP_TIMEOUT)
            .map_err(ProviderBuildError::HttpClient)?,
    };

    let mut providers = Vec::with_capacity(configs.len());
    for provider_config in configs {
        let runner = source.runner_for(&provider_config)?;
        let client = PulumiClient::new(&provider_config, http.clone()).map_err(|source| {
            ProviderBuildError::InvalidApi {
                id: provider_config.id.clone(),
                source,
            }
        })?;

        info!(
            provider = %provider_config.provider_name(),
            organization = %provider_config.organization,
            api = %provider_config.api,
            "Configured Pulumi entity provider"
        );
        providers.push(PulumiEntityProvider::new(
            provider_config,
            client,
            transformer.clone(),
            runner,
        ));
    }

    Ok(providers)
}
