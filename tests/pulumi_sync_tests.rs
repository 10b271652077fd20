//! End-to-end refresh cycles against a mocked Pulumi API and the in-memory catalog.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulumi_catalog::catalog::{
    ANNOTATION_LOCATION, ANNOTATION_ORIGIN_LOCATION, ANNOTATION_SOURCE_LOCATION, Entity,
    EntityMutation, EntityProviderConnection, InMemoryCatalog, SinkError,
};
use pulumi_catalog::config::{ConfigReader, ScheduleDefinition};
use pulumi_catalog::provider::{
    ProviderDeps, PulumiEntityProvider, RefreshError, RefreshOutcome, build_providers,
};
use pulumi_catalog::pulumi::{
    DefaultResourceTransformer, PULUMI_ACCEPT_HEADER, PulumiProviderConfig, ResourceTransformer,
    StackDetail, TransformError,
};
use pulumi_catalog::scheduler::{
    OneShotTaskRunner, RetryPolicy, SchedulerError, TaskInvocation, TaskRunner, TaskScheduler,
};
use serde_json::{Value, json};
use tracing::subscriber::DefaultGuard;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROVIDER: &str = "pulumi-provider:prod";

/// Runner that records the tasks it is handed without running them.
#[derive(Default)]
struct RecordingRunner {
    task_ids: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: TaskInvocation) -> Result<(), SchedulerError> {
        self.task_ids.lock().unwrap().push(task.id);
        Ok(())
    }
}

/// Sink that rejects every mutation.
struct RejectingSink;

#[async_trait]
impl EntityProviderConnection for RejectingSink {
    async fn apply_mutation(&self, _mutation: EntityMutation) -> Result<(), SinkError> {
        Err(SinkError::Rejected("catalog is read-only".to_string()))
    }
}

/// Sink that keeps every mutation it receives.
#[derive(Default)]
struct CapturingSink {
    mutations: Mutex<Vec<EntityMutation>>,
}

#[async_trait]
impl EntityProviderConnection for CapturingSink {
    async fn apply_mutation(&self, mutation: EntityMutation) -> Result<(), SinkError> {
        self.mutations.lock().unwrap().push(mutation);
        Ok(())
    }
}

/// Transformer that fails for one project and defers to the default otherwise.
struct FailingForProject(&'static str);

#[async_trait]
impl ResourceTransformer for FailingForProject {
    async fn transform(
        &self,
        detail: &StackDetail,
        config: &PulumiProviderConfig,
    ) -> Result<Option<Entity>, TransformError> {
        if detail.project_name == self.0 {
            return Err(TransformError::Invalid {
                stack: detail.slug(),
                reason: "unsupported project".to_string(),
            });
        }
        DefaultResourceTransformer.transform(detail, config).await
    }
}

/// Formatted log output of the current test thread.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

fn document(api: &str) -> ConfigReader {
    ConfigReader::from_value(json!({
        "catalog": { "providers": { "pulumi": {
            "prod": { "api": api, "organization": "acme", "pulumiAccessToken": "pul-token" }
        } } }
    }))
}

fn build_provider(server: &MockServer, deps: ProviderDeps) -> PulumiEntityProvider {
    let mut providers = build_providers(&document(&server.uri()), deps).expect("providers build");
    assert_eq!(providers.len(), 1);
    providers.remove(0)
}

fn recording_deps() -> (Arc<RecordingRunner>, ProviderDeps) {
    let runner = Arc::new(RecordingRunner::default());
    let deps = ProviderDeps {
        schedule: Some(runner.clone()),
        ..ProviderDeps::default()
    };
    (runner, deps)
}

fn summary(project: &str, stack: &str) -> Value {
    json!({ "orgName": "acme", "projectName": project, "stackName": stack, "lastUpdate": 1700000000, "resourceCount": 4 })
}

async fn mount_listing(server: &MockServer, stacks: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/api/user/stacks"))
        .and(query_param("organization", "acme"))
        .and(header("authorization", "token pul-token"))
        .and(header("accept", PULUMI_ACCEPT_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stacks": stacks })))
        .mount(server)
        .await;
}

async fn mount_detail(server: &MockServer, project: &str, stack: &str, tags: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/api/stacks/acme/{project}/{stack}")))
        .and(header("authorization", "token pul-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orgName": "acme",
            "projectName": project,
            "stackName": stack,
            "activeUpdate": "u-1",
            "tags": tags,
            "version": 7
        })))
        .mount(server)
        .await;
}

async fn mount_detail_status(server: &MockServer, project: &str, stack: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/api/stacks/acme/{project}/{stack}")))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "code": status,
            "message": "upstream error"
        })))
        .mount(server)
        .await;
}

fn names(catalog: &InMemoryCatalog) -> Vec<String> {
    catalog
        .entities()
        .into_iter()
        .map(|deferred| deferred.entity.metadata.name)
        .collect()
}

#[tokio::test]
async fn refresh_before_connect_is_uninitialized() {
    let server = MockServer::start().await;
    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);

    let err = provider.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::Uninitialized { .. }));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn connect_arms_refresh_task_once() {
    let server = MockServer::start().await;
    let (runner, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();

    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();
    assert_eq!(
        *runner.task_ids.lock().unwrap(),
        vec![format!("{PROVIDER}:refresh")]
    );

    let err = provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::AlreadyConnected { .. }));
    assert_eq!(runner.task_ids.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn refresh_publishes_decorated_entities() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev"), summary("api", "prod")]).await;
    mount_detail(
        &server,
        "web",
        "dev",
        json!({ "gitHub:owner": "acme", "gitHub:repo": "web", "pulumi:description": "Website" }),
    )
    .await;
    mount_detail(&server, "api", "prod", json!({})).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();

    assert_eq!(provider.refresh().await.unwrap(), 2);
    assert_eq!(names(&catalog), vec!["api", "web"]);

    let published = catalog.entities_for_location_key(PROVIDER);
    assert_eq!(published.len(), 2);
    let web = published
        .iter()
        .find(|deferred| deferred.entity.metadata.name == "web")
        .expect("web entity");
    assert_eq!(web.location_key.as_deref(), Some(PROVIDER));
    assert_eq!(web.entity.metadata.description.as_deref(), Some("Website"));
    assert_eq!(
        web.entity.annotation("github.com/project-slug"),
        Some("acme/web")
    );
    for key in [
        ANNOTATION_LOCATION,
        ANNOTATION_ORIGIN_LOCATION,
        ANNOTATION_SOURCE_LOCATION,
    ] {
        assert_eq!(
            web.entity.annotation(key),
            Some("url:https://app.pulumi.com/acme/web/dev")
        );
    }

    let status = provider.status();
    assert_eq!(status.last_outcome, Some(RefreshOutcome::Succeeded));
    assert_eq!(status.last_entity_count, Some(2));
    assert!(status.last_task_instance_id.is_some());
}

#[tokio::test]
async fn repeated_refresh_is_idempotent() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev"), summary("api", "prod")]).await;
    mount_detail(&server, "web", "dev", json!({ "pulumi:env": "dev" })).await;
    mount_detail(&server, "api", "prod", json!({ "pulumi:env": "prod" })).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let sink = Arc::new(CapturingSink::default());
    provider.connect(sink.clone()).await.unwrap();

    provider.refresh().await.unwrap();
    provider.refresh().await.unwrap();

    let mutations = sink.mutations.lock().unwrap();
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[0], mutations[1]);
    assert!(matches!(&mutations[0], EntityMutation::Full { entities } if entities.len() == 2));
}

#[tokio::test]
async fn failing_stacks_are_skipped() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        vec![
            summary("web", "dev"),
            summary("broken", "dev"),
            summary("gone", "dev"),
            summary("api", "prod"),
        ],
    )
    .await;
    mount_detail(&server, "web", "dev", json!({})).await;
    mount_detail_status(&server, "broken", "dev", 500).await;
    mount_detail_status(&server, "gone", "dev", 404).await;
    mount_detail(&server, "api", "prod", json!({})).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();

    let (logs, _guard) = capture_logs();
    assert_eq!(provider.refresh().await.unwrap(), 2);
    assert_eq!(names(&catalog), vec!["api", "web"]);

    let broken = logs.lines_containing("stack=acme/broken/dev");
    assert_eq!(broken.len(), 1, "{}", logs.contents());
    assert!(broken[0].contains("WARN"));
    assert!(broken[0].contains("Failed to fetch stack detail, skipping"));

    let gone = logs.lines_containing("stack=acme/gone/dev");
    assert_eq!(gone.len(), 1, "{}", logs.contents());
    assert!(gone[0].contains("WARN"));
    assert!(gone[0].contains("Stack not found, skipping"));
}

#[tokio::test]
async fn transformer_failure_is_isolated_to_its_stack() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev"), summary("legacy", "dev")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;
    mount_detail(&server, "legacy", "dev", json!({})).await;

    let (_, mut deps) = recording_deps();
    deps.transformer = Some(Arc::new(FailingForProject("legacy")));
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();

    let (logs, _guard) = capture_logs();
    assert_eq!(provider.refresh().await.unwrap(), 1);
    assert_eq!(names(&catalog), vec!["web"]);

    let legacy = logs.lines_containing("Failed to transform stack, skipping");
    assert_eq!(legacy.len(), 1, "{}", logs.contents());
    assert!(legacy[0].contains("WARN"));
    assert!(legacy[0].contains("stack=acme/legacy/dev"));
}

#[tokio::test]
async fn removed_stacks_disappear_on_next_refresh() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev"), summary("api", "prod")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;
    mount_detail(&server, "api", "prod", json!({})).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();
    provider.refresh().await.unwrap();
    assert_eq!(catalog.len(), 2);

    server.reset().await;
    mount_listing(&server, vec![summary("api", "prod")]).await;
    mount_detail(&server, "api", "prod", json!({})).await;

    provider.refresh().await.unwrap();
    assert_eq!(names(&catalog), vec!["api"]);
}

#[tokio::test]
async fn listing_failure_keeps_previous_entities() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();
    provider.refresh().await.unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/api/user/stacks"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = provider.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::Listing { .. }));
    assert_eq!(names(&catalog), vec!["web"]);

    let status = provider.status();
    assert_eq!(status.last_outcome, Some(RefreshOutcome::Failed));
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.unwrap_or_default().contains("503"));
    assert_eq!(status.last_entity_count, Some(1));
}

#[tokio::test]
async fn listing_failure_logs_error_and_publishes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/user/stacks"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let sink = Arc::new(CapturingSink::default());
    provider.connect(sink.clone()).await.unwrap();

    let (logs, _guard) = capture_logs();
    let err = provider.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::Listing { .. }));
    assert!(sink.mutations.lock().unwrap().is_empty());

    let failures = logs.lines_containing("Refresh failed");
    assert_eq!(failures.len(), 1, "{}", logs.contents());
    assert!(failures[0].contains("ERROR"));
    assert!(failures[0].contains("500"));
}

#[tokio::test]
async fn stacks_of_one_project_publish_a_single_entity() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev"), summary("web", "prod")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;
    mount_detail(&server, "web", "prod", json!({})).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();

    let (logs, _guard) = capture_logs();
    let published = provider.refresh().await.unwrap();
    assert_eq!(published, 1);
    assert_eq!(published, catalog.len());
    assert_eq!(provider.status().last_entity_count, Some(1));

    let web = catalog.entities();
    assert_eq!(
        web[0].entity.annotation(ANNOTATION_SOURCE_LOCATION),
        Some("url:https://app.pulumi.com/acme/web/dev")
    );

    let duplicates = logs.lines_containing("already produced by another stack");
    assert_eq!(duplicates.len(), 1, "{}", logs.contents());
    assert!(duplicates[0].contains("stack=acme/web/prod"));
    assert!(duplicates[0].contains("kept_stack=acme/web/dev"));
}

#[tokio::test]
async fn failed_scheduling_leaves_provider_unconnected() {
    let server = MockServer::start().await;
    let scheduler = TaskScheduler::new(RetryPolicy::default());
    let provider = build_provider(
        &server,
        ProviderDeps {
            scheduler: Some(scheduler.clone()),
            default_schedule: Some(ScheduleDefinition::new(
                Duration::from_secs(60),
                Duration::from_secs(5),
            )),
            ..ProviderDeps::default()
        },
    );
    scheduler.shutdown().await;

    let catalog = InMemoryCatalog::new();
    let err = provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RefreshError::Schedule {
            source: SchedulerError::ShutDown,
            ..
        }
    ));
    assert!(!provider.is_connected());

    // A later attempt is judged on scheduling again, not refused as a duplicate.
    let err = provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::Schedule { .. }));
}

#[tokio::test]
async fn publish_failure_is_reported() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    provider.connect(Arc::new(RejectingSink)).await.unwrap();

    let err = provider.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::Publish { .. }));
}

#[tokio::test]
async fn empty_organization_publishes_empty_set() {
    let server = MockServer::start().await;
    mount_listing(&server, Vec::new()).await;

    let (_, deps) = recording_deps();
    let provider = build_provider(&server, deps);
    let sink = Arc::new(CapturingSink::default());
    provider.connect(sink.clone()).await.unwrap();

    assert_eq!(provider.refresh().await.unwrap(), 0);
    assert_eq!(
        *sink.mutations.lock().unwrap(),
        vec![EntityMutation::full(Vec::new())]
    );
}

#[tokio::test]
async fn one_shot_runner_refreshes_on_connect() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;

    let provider = build_provider(
        &server,
        ProviderDeps {
            schedule: Some(Arc::new(OneShotTaskRunner::new())),
            ..ProviderDeps::default()
        },
    );
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();

    assert_eq!(names(&catalog), vec!["web"]);
    assert_eq!(provider.status().last_outcome, Some(RefreshOutcome::Succeeded));
}

#[tokio::test]
async fn scheduled_provider_refreshes_in_background() {
    let server = MockServer::start().await;
    mount_listing(&server, vec![summary("web", "dev")]).await;
    mount_detail(&server, "web", "dev", json!({})).await;

    let scheduler = TaskScheduler::new(RetryPolicy::default());
    let provider = build_provider(
        &server,
        ProviderDeps {
            scheduler: Some(scheduler.clone()),
            default_schedule: Some(ScheduleDefinition::new(
                Duration::from_millis(50),
                Duration::from_secs(5),
            )),
            ..ProviderDeps::default()
        },
    );
    let catalog = InMemoryCatalog::new();
    provider
        .connect(catalog.connection(provider.provider_name()))
        .await
        .unwrap();

    let mut attempts = 0;
    while catalog.is_empty() && attempts < 50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        attempts += 1;
    }
    assert_eq!(names(&catalog), vec!["web"]);
    assert_eq!(
        scheduler.running_tasks().await,
        vec![format!("{PROVIDER}:refresh")]
    );

    scheduler.shutdown().await;
    assert!(scheduler.running_tasks().await.is_empty());
}
