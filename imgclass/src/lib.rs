//! # imgclass: Upload-and-Classify Proxy
//!
//! `imgclass` sits between a browser and an external image classification service. A user
//! uploads one image; the proxy validates it, stages it briefly, forwards it to the
//! classification service as `multipart/form-data`, and relays the ranked predictions back
//! unchanged. Whatever goes wrong along the way, the caller receives a JSON body of the form
//! `{"error": "<message>"}` and never a partial success.
//!
//! ## Request Flow
//!
//! A `POST /api/classify` request passes through these steps:
//!
//! 1. The multipart body is read and the first `file` field carrying a filename is taken.
//!    Anything that is not an `image/*` content type is rejected with `400`.
//! 2. The bytes are written to a [`staging::StagingStorage`] under a collision-free name.
//! 3. The staged copy is read back and posted to the classification service through a
//!    [`classifier::Classifier`].
//! 4. The staged copy is released, on success and on every failure.
//! 5. The backend reply is normalized by [`classifier::normalize`]: predictions pass through,
//!    everything else becomes an [`errors::Error`].
//!
//! ## Client Driver
//!
//! [`client::ClassifyDriver`] is the other half of the system: the state machine a user
//! interface drives to select a file, submit it, and render predictions or an error. The
//! `imgclass-classify` binary is a thin command line front end over it.
//!
//! ## Configuration
//!
//! Configuration is loaded from YAML with environment variable overrides; see [`config`].
//! Observability comes from [`tracing`] (optionally exported over OTLP, see [`telemetry`])
//! and Prometheus metrics served at `/internal/metrics` when `enable_metrics` is set.

pub mod api;
pub mod classifier;
pub mod client;
pub mod config;
pub mod errors;
pub mod metrics;
mod openapi;
pub mod staging;
pub mod telemetry;

#[cfg(test)]
mod test;

use crate::{
    classifier::{Classifier, ReqwestClassifier},
    config::{CorsOrigin, StagingConfig},
    metrics::ClassifyMetrics,
    openapi::ApiDoc,
    staging::{DiskStaging, MemoryStaging, StagingStorage},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue, Method},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Install the process-wide rustls crypto provider.
///
/// reqwest is built without a bundled provider, so this must run before any HTTP client is
/// constructed. Calling it more than once is harmless.
pub fn install_crypto_provider() {
    // Err means a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Shared state handed to every request handler.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .classifier(classifier)
///     .staging(staging)
///     .maybe_metrics(metrics)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub classifier: Arc<dyn Classifier>,
    pub staging: Arc<dyn StagingStorage>,
    pub metrics: Option<ClassifyMetrics>,
}

/// Create the staging backend selected in config
pub async fn build_staging(config: &StagingConfig) -> anyhow::Result<Arc<dyn StagingStorage>> {
    match config {
        StagingConfig::Disk { .. } => {
            // disk_dir is always Some for the disk backend
            let dir = config.disk_dir().unwrap_or_else(|| std::env::temp_dir().join("imgclass-uploads"));
            let staging = DiskStaging::new(&dir).await?;
            info!("Staging uploads on disk in {}", dir.display());
            Ok(Arc::new(staging))
        }
        StagingConfig::Memory => {
            info!("Staging uploads in memory");
            Ok(Arc::new(MemoryStaging::new()))
        }
    }
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config.cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
        // tower-http refuses a literal "*" inside an origin list
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// - `POST /api/classify` (body limited to `limits.max_upload_bytes`)
/// - `GET /healthz`
/// - OpenAPI document at `/api-docs/openapi.json`, interactive docs at `/docs`
/// - `GET /internal/metrics` when metrics are enabled
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let api_routes = Router::new()
        .route("/classify", post(api::handlers::classify::classify))
        .layer(DefaultBodyLimit::max(state.config.limits.max_upload_bytes));

    let cors_layer = create_cors_layer(&state.config)?;
    let enable_metrics = state.config.enable_metrics;
    let classify_metrics = state.metrics.clone();

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api", api_routes)
        .with_state(state)
        .route("/api-docs/openapi.json", get(|| async { axum::Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .layer(cors_layer);

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

        // HTTP metrics from axum-prometheus followed by the classification registry
        router = router
            .route(
                "/internal/metrics",
                get(move || {
                    let metric_handle = metric_handle.clone();
                    let classify_metrics = classify_metrics.clone();
                    async move {
                        let mut rendered = metric_handle.render();
                        if let Some(metrics) = classify_metrics {
                            rendered.push_str(&metrics.render());
                        }
                        rendered
                    }
                }),
            )
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// A configured proxy, ready to serve
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting classification proxy with configuration: {:#?}", config);

        let classifier = ReqwestClassifier::new(&config.classifier)?;
        info!("Forwarding classifications to {}", classifier.endpoint());

        let staging = build_staging(&config.staging).await?;

        let metrics = if config.enable_metrics {
            Some(ClassifyMetrics::new(&prometheus::Registry::new())?)
        } else {
            None
        };

        let state = AppState::builder()
            .config(config.clone())
            .classifier(Arc::new(classifier))
            .staging(staging)
            .maybe_metrics(metrics)
            .build();

        let router = build_router(state)?;

        Ok(Self { router, config })
    }

    pub fn into_router(self) -> Router {
        self.router
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Serve until `shutdown` resolves, then flush telemetry
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Classification proxy listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
