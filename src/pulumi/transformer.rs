//! Stack to catalog entity mapping.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use super::types::{PulumiProviderConfig, StackDetail};
use crate::catalog::{
    DEFAULT_NAMESPACE, Entity, EntityMetadata, GITHUB_PROJECT_SLUG_ANNOTATION,
    PULUMI_ORGA_SLUG_ANNOTATION, PULUMI_PROJECT_SLUG_ANNOTATION, ResourceSpec,
};

/// Stack tag holding a free-form description; mapped to `metadata.description`.
pub const DESCRIPTION_TAG: &str = "pulumi:description";
pub const GITHUB_OWNER_TAG: &str = "gitHub:owner";
pub const GITHUB_REPO_TAG: &str = "gitHub:repo";

pub const RESOURCE_TYPE: &str = "service";
pub const RESOURCE_OWNER: &str = "pulumi";

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9+#]+$").unwrap_or_else(|err| panic!("invalid tag pattern: {err}"))
});

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("stack {stack} cannot be mapped: {reason}")]
    Invalid { stack: String, reason: String },
}

/// Maps a stack detail to at most one catalog entity.
///
/// `Ok(None)` means the stack is intentionally not represented in the catalog.
#[async_trait]
pub trait ResourceTransformer: Send + Sync {
    async fn transform(
        &self,
        detail: &StackDetail,
        config: &PulumiProviderConfig,
    ) -> Result<Option<Entity>, TransformError>;
}

/// Produces a `Resource` entity named after the stack's project.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResourceTransformer;

#[async_trait]
impl ResourceTransformer for DefaultResourceTransformer {
    async fn transform(
        &self,
        detail: &StackDetail,
        _config: &PulumiProviderConfig,
    ) -> Result<Option<Entity>, TransformError> {
        if detail.project_name.is_empty() {
            return Ok(None);
        }

        let mut metadata = EntityMetadata::new(detail.project_name.clone());
        metadata.namespace = Some(DEFAULT_NAMESPACE.to_string());
        metadata.description = detail.tags.get(DESCRIPTION_TAG).cloned();

        if let (Some(owner), Some(repo)) = (
            detail.tags.get(GITHUB_OWNER_TAG),
            detail.tags.get(GITHUB_REPO_TAG),
        ) {
            metadata.annotations.insert(
                GITHUB_PROJECT_SLUG_ANNOTATION.to_string(),
                format!("{owner}/{repo}"),
            );
        }
        metadata
            .annotations
            .insert(PULUMI_PROJECT_SLUG_ANNOTATION.to_string(), detail.slug());
        metadata
            .annotations
            .insert(PULUMI_ORGA_SLUG_ANNOTATION.to_string(), detail.org_name.clone());

        metadata.tags = filter_tags(
            detail
                .tags
                .iter()
                .filter(|(key, _)| key.as_str() != DESCRIPTION_TAG)
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );

        Ok(Some(Entity::resource(
            metadata,
            ResourceSpec {
                resource_type: RESOURCE_TYPE.to_string(),
                owner: RESOURCE_OWNER.to_string(),
                system: None,
            },
        )))
    }
}

/// Turns stack tags into catalog tags of the form `key:value`.
///
/// Everything up to and including the first `:` of a key is dropped. A tag is
/// kept only when both the stripped key and the value match `^[a-z0-9+#]+$`.
/// Output order follows input order.
pub fn filter_tags<'a, I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    tags.into_iter()
        .filter_map(|(key, value)| {
            let key = key.split_once(':').map_or(key, |(_, rest)| rest);
            (TAG_PATTERN.is_match(key) && TAG_PATTERN.is_match(value))
                .then(|| format!("{key}:{value}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulumi::types::AccessToken;
    use std::collections::BTreeMap;

    fn config() -> PulumiProviderConfig {
        PulumiProviderConfig {
            id: "prod".to_string(),
            api: "https://api.pulumi.com".to_string(),
            organization: "acme".to_string(),
            access_token: AccessToken::new("t"),
            schedule: None,
        }
    }

    fn detail(project: &str, tags: &[(&str, &str)]) -> StackDetail {
        StackDetail {
            org_name: "acme".to_string(),
            project_name: project.to_string(),
            stack_name: "dev".to_string(),
            active_update: String::new(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            version: 1,
        }
    }

    #[test]
    fn filter_tags_strips_namespace_and_checks_charset() {
        let tags = filter_tags([("pulumi:env", "prod"), ("team", "Core")]);
        assert_eq!(tags, vec!["env:prod".to_string()]);

        let tags = filter_tags([("a:b:c", "x"), ("lang", "c++"), ("chan", "#ops")]);
        // "a:b:c" strips to "b:c", whose colon fails the charset
        assert_eq!(tags, vec!["lang:c++".to_string(), "chan:#ops".to_string()]);
    }

    #[test]
    fn filter_tags_rejects_empty_parts() {
        assert!(filter_tags([("pulumi:", "x"), ("env", "")]).is_empty());
    }

    #[tokio::test]
    async fn maps_stack_to_resource() {
        let detail = detail(
            "web",
            &[
                ("gitHub:owner", "acme"),
                ("gitHub:repo", "web"),
                ("pulumi:description", "Public website"),
                ("pulumi:runtime", "nodejs"),
            ],
        );

        let entity = DefaultResourceTransformer
            .transform(&detail, &config())
            .await
            .unwrap()
            .expect("entity produced");

        assert_eq!(entity.kind, "Resource");
        assert_eq!(entity.metadata.name, "web");
        assert_eq!(entity.namespace(), "default");
        assert_eq!(entity.metadata.description.as_deref(), Some("Public website"));
        assert_eq!(
            entity.annotation(GITHUB_PROJECT_SLUG_ANNOTATION),
            Some("acme/web")
        );
        assert_eq!(
            entity.annotation(PULUMI_PROJECT_SLUG_ANNOTATION),
            Some("acme/web/dev")
        );
        assert_eq!(entity.annotation(PULUMI_ORGA_SLUG_ANNOTATION), Some("acme"));
        assert_eq!(
            entity.metadata.tags,
            vec![
                "owner:acme".to_string(),
                "repo:web".to_string(),
                "runtime:nodejs".to_string()
            ]
        );
        assert_eq!(entity.spec["type"], "service");
        assert_eq!(entity.spec["owner"], "pulumi");
    }

    #[tokio::test]
    async fn description_is_consumed_and_unsafe_tags_dropped() {
        let detail = detail(
            "web",
            &[
                ("gitHub:owner", "acme"),
                ("pulumi:description", "x Y"),
                ("weird:Key!", "v"),
            ],
        );
        let entity = DefaultResourceTransformer
            .transform(&detail, &config())
            .await
            .unwrap()
            .expect("entity produced");

        assert_eq!(entity.metadata.description.as_deref(), Some("x Y"));
        assert_eq!(entity.metadata.tags, vec!["owner:acme".to_string()]);
    }

    #[tokio::test]
    async fn github_slug_requires_both_tags() {
        let detail = detail("web", &[("gitHub:owner", "acme")]);
        let entity = DefaultResourceTransformer
            .transform(&detail, &config())
            .await
            .unwrap()
            .expect("entity produced");
        assert_eq!(entity.annotation(GITHUB_PROJECT_SLUG_ANNOTATION), None);
        assert!(entity.metadata.description.is_none());
    }

    #[tokio::test]
    async fn empty_project_is_declined() {
        let detail = detail("", &[]);
        let entity = DefaultResourceTransformer
            .transform(&detail, &config())
            .await
            .unwrap();
        assert!(entity.is_none());
    }

    #[tokio::test]
    async fn emitted_tags_always_match_pattern() {
        let detail = detail(
            "web",
            &[
                ("Env", "prod"),
                ("x:UPPER", "v"),
                ("k", "with space"),
                ("ok:fine", "c#"),
                ("pulumi:description", "desc"),
                ("plain", "1+1"),
            ],
        );
        let entity = DefaultResourceTransformer
            .transform(&detail, &config())
            .await
            .unwrap()
            .expect("entity produced");

        assert_eq!(
            entity.metadata.tags,
            vec!["fine:c#".to_string(), "plain:1+1".to_string()]
        );
        for tag in &entity.metadata.tags {
            let (key, value) = tag.split_once(':').expect("key:value");
            assert!(TAG_PATTERN.is_match(key));
            assert!(TAG_PATTERN.is_match(value));
        }
    }
}
