//! Logging setup for the sync service and request ids for the status API.
//!
//! Refresh cycles log inside the `pulumi_provider` and `refresh` spans; the JSON
//! format keeps the innermost span on every line so a failed stack can be traced
//! back to its provider and task instance. Status API requests get an
//! `x-request-id` that also lands in problem+json bodies.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use log::LevelFilter;
use thiserror::Error;
use tokio::{task_local, time::Instant};
use tracing::{Instrument, debug, info_span};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

/// Header carrying the request id, echoed back on responses.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// HTTP and TLS internals that drown out refresh logs at debug level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

/// Status API request being served by the current task.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

task_local! {
    static ACTIVE_REQUEST: RequestContext;
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Filter directives for `level`, keeping HTTP client internals at warn.
pub fn default_directives(level: &str) -> String {
    QUIET_TARGETS
        .iter()
        .fold(level.to_string(), |mut directives, target| {
            directives.push_str(&format!(",{target}=warn"));
            directives
        })
}

/// Installs the global subscriber once. `RUST_LOG` replaces the configured
/// directives entirely.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: failed to install log tracer bridge: {err}. Records from `log` users such as reqwest will be dropped."
            );
        }
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().with_target(false).boxed(),
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: failed to set global tracing subscriber: {err}. Provider logs go to the existing subscriber."
        );
    }

    Ok(())
}

/// Runs `future` with `context` visible to [`current_request_id`].
pub async fn with_request_context<Fut, R>(context: RequestContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_REQUEST.scope(context, future).await
}

pub fn current_request_id() -> Option<String> {
    ACTIVE_REQUEST
        .try_with(|ctx| ctx.request_id.clone())
        .ok()
}

fn request_id_from(request: &Request) -> String {
    request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Reuses the caller's `x-request-id` or mints one, and echoes it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request_id_from(&request);
    let context = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(context.clone());

    let span = info_span!(
        "status_api",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id
    );
    let started = Instant::now();
    let mut response = with_request_context(context, next.run(request))
        .instrument(span.clone())
        .await;
    debug!(
        parent: &span,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Status API request served"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}
