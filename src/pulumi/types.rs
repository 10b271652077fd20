//! Pulumi Cloud API types and per-provider configuration.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::ScheduleDefinition;

/// Bearer credential for the Pulumi API. Zeroized on drop and never printed.
#[derive(Clone)]
pub struct AccessToken(Zeroizing<String>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// One configured Pulumi organization integration.
#[derive(Debug, Clone)]
pub struct PulumiProviderConfig {
    /// Configuration key of this provider, unique among providers.
    pub id: String,
    /// Base URL of the Pulumi REST API, e.g. `https://api.pulumi.com`.
    pub api: String,
    pub organization: String,
    pub access_token: AccessToken,
    pub schedule: Option<ScheduleDefinition>,
}

impl PulumiProviderConfig {
    /// Name used as the catalog location key and in logs.
    pub fn provider_name(&self) -> String {
        format!("pulumi-provider:{}", self.id)
    }

    /// Identifier of the recurring refresh task.
    pub fn task_id(&self) -> String {
        format!("{}:refresh", self.provider_name())
    }
}

/// Row from `GET /api/user/stacks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSummary {
    pub org_name: String,
    pub project_name: String,
    pub stack_name: String,
    /// Unix seconds of the last update.
    #[serde(default)]
    pub last_update: Option<i64>,
    #[serde(default)]
    pub resource_count: Option<i64>,
}

impl StackSummary {
    pub fn slug(&self) -> String {
        stack_slug(&self.org_name, &self.project_name, &self.stack_name)
    }
}

/// Response of `GET /api/user/stacks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StacksPage {
    #[serde(default)]
    pub stacks: Vec<StackSummary>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

/// Response of `GET /api/stacks/{org}/{project}/{stack}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDetail {
    pub org_name: String,
    pub project_name: String,
    pub stack_name: String,
    #[serde(default)]
    pub active_update: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub version: i64,
}

impl StackDetail {
    pub fn slug(&self) -> String {
        stack_slug(&self.org_name, &self.project_name, &self.stack_name)
    }
}

pub(crate) fn stack_slug(org: &str, project: &str, stack: &str) -> String {
    format!("{org}/{project}/{stack}")
}
