//! # Server Configuration
//!
//! Router and listener for the read-only status API.

use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::catalog::InMemoryCatalog;
use crate::config::AppConfig;
use crate::handlers;
use crate::provider::PulumiEntityProvider;
use crate::telemetry::request_id_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub catalog: InMemoryCatalog,
    pub providers: Arc<Vec<PulumiEntityProvider>>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/entities", get(handlers::list_entities))
        .route("/providers", get(handlers::list_providers))
        .route("/providers/{name}", get(handlers::get_provider))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
}

/// Serves the status API until `shutdown` fires.
pub async fn run_server(
    config: &AppConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Status API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status API stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::list_entities,
        crate::handlers::list_providers,
        crate::handlers::get_provider,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::HealthResponse,
            crate::models::EntityListResponse,
            crate::models::ProviderInfo,
            crate::models::ProviderListResponse,
            crate::provider::RefreshStatus,
            crate::provider::RefreshOutcome,
            crate::catalog::DeferredEntity,
            crate::catalog::Entity,
            crate::catalog::EntityMetadata,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Pulumi Catalog Status API",
        description = "Read-only view of the entities synchronized from Pulumi Cloud",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
