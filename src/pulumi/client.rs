//! Pulumi Cloud REST client
//!
//! Read-only access to the two endpoints the catalog provider needs: listing the
//! stacks of an organization and fetching the detail of a single stack.

use std::time::Duration;

use reqwest::{
    StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::types::{AccessToken, PulumiProviderConfig, StackDetail, StacksPage, stack_slug};

/// Media type selecting version 8 of the Pulumi service API.
pub const PULUMI_ACCEPT_HEADER: &str = "application/vnd.pulumi+8";

const USER_AGENT: &str = concat!("pulumi-catalog/", env!("CARGO_PKG_VERSION"));

/// Upstream error bodies are truncated to this many characters.
const BODY_SNIPPET_CHARS: usize = 200;

/// Errors returned by [`PulumiClient`].
#[derive(Debug, Error)]
pub enum PulumiClientError {
    #[error("network error calling {url}: {source}")]
    Network {
        url: String,
        source: reqwest::Error,
    },
    #[error("request to {url} failed with status {status}: {body}")]
    Http {
        url: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[error("invalid API base url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
}

impl PulumiClientError {
    /// HTTP status of the failed response, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            PulumiClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Client bound to one provider's API base URL, organization and token.
#[derive(Debug, Clone)]
pub struct PulumiClient {
    http: reqwest::Client,
    base_url: Url,
    organization: String,
    access_token: AccessToken,
}

impl PulumiClient {
    /// Builds the shared HTTP client with the service user agent and a request timeout.
    pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
    }

    pub fn new(
        config: &PulumiProviderConfig,
        http: reqwest::Client,
    ) -> Result<Self, PulumiClientError> {
        let base_url = parse_base_url(&config.api)?;
        Ok(Self {
            http,
            base_url,
            organization: config.organization.clone(),
            access_token: config.access_token.clone(),
        })
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// `GET {api}/api/user/stacks?organization={org}`
    ///
    /// Returns a single page; the continuation token is surfaced but not followed.
    pub async fn list_stacks(&self) -> Result<StacksPage, PulumiClientError> {
        let mut url = self.endpoint(&["api", "user", "stacks"])?;
        url.query_pairs_mut()
            .append_pair("organization", &self.organization);

        let response = self.get(&url).await?;
        let page: StacksPage = decode(&url, response).await?;

        debug!(
            organization = %self.organization,
            stacks = page.stacks.len(),
            has_continuation = page.continuation_token.is_some(),
            "Listed Pulumi stacks"
        );

        Ok(page)
    }

    /// `GET {api}/api/stacks/{org}/{project}/{stack}`
    ///
    /// A 404 yields `Ok(None)`; error bodies are never decoded as a detail record.
    pub async fn get_stack_detail(
        &self,
        org_name: &str,
        project_name: &str,
        stack_name: &str,
    ) -> Result<Option<StackDetail>, PulumiClientError> {
        let url = self.endpoint(&["api", "stacks", org_name, project_name, stack_name])?;
        let response = self.get(&url).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(
                stack = %stack_slug(org_name, project_name, stack_name),
                "Stack not found"
            );
            return Ok(None);
        }

        decode(&url, response).await.map(Some)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, PulumiClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PulumiClientError::InvalidUrl {
                value: self.base_url.to_string(),
                reason: "url cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, PulumiClientError> {
        self.http
            .get(url.clone())
            .header(
                AUTHORIZATION,
                format!("token {}", self.access_token.expose()),
            )
            .header(ACCEPT, PULUMI_ACCEPT_HEADER)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|source| PulumiClientError::Network {
                url: url.to_string(),
                source,
            })
    }
}

/// Parses and checks an API base URL; used by config validation as well.
pub fn parse_base_url(value: &str) -> Result<Url, PulumiClientError> {
    let url = Url::parse(value).map_err(|err| PulumiClientError::InvalidUrl {
        value: value.to_string(),
        reason: err.to_string(),
    })?;

    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(PulumiClientError::InvalidUrl {
            value: value.to_string(),
            reason: "expected an http(s) url".to_string(),
        });
    }

    Ok(url)
}

async fn decode<T: DeserializeOwned>(
    url: &Url,
    response: reqwest::Response,
) -> Result<T, PulumiClientError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| PulumiClientError::Network {
            url: url.to_string(),
            source,
        })?;

    if !status.is_success() {
        return Err(PulumiClientError::Http {
            url: url.to_string(),
            status: status.as_u16(),
            body: snippet(&body),
        });
    }

    serde_json::from_str(&body).map_err(|source| PulumiClientError::Decode {
        url: url.to_string(),
        source,
    })
}

fn snippet(body: &str) -> String {
    if body.chars().count() > BODY_SNIPPET_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}
