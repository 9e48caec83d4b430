//! HTTP surface: shared context, router and background expiry sweeper

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::anonymize::AnonymizationEngine;
use crate::config::Config;
use crate::deanonymize::DeanonymizationEngine;
use crate::detection::{Detector, RuleDetector};
use crate::error::{AnontexError, Result};
use crate::faker::FakerEngine;
use crate::mapping::MappingStore;
use crate::proxy::{ProxyPipeline, ProxyRequestContext};

/// Everything a request handler needs. Built once at startup.
pub struct AppContext {
    pub config: Config,
    pub store: MappingStore,
    pub pipeline: ProxyPipeline,
}

impl AppContext {
    pub fn new(
        config: Config,
        detector: Arc<dyn Detector>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let store = MappingStore::new(config.mapping.clone())?;
        let faker = Arc::new(FakerEngine::new(&config.faker));
        for entity_type in &config.detection.entities {
            if !faker.is_known_type(entity_type) {
                warn!(
                    "No {} generator for entity type '{}', generic tokens will be used",
                    faker.locale(),
                    entity_type
                );
            }
        }

        let anonymizer = AnonymizationEngine::new(
            detector,
            faker,
            store.clone(),
            store.default_ttl(),
            config.faker.max_collision_retries,
        );
        let deanonymizer = DeanonymizationEngine::new(store.clone());

        let pipeline = ProxyPipeline::new(
            anonymizer,
            deanonymizer,
            store.clone(),
            client,
            config.upstream_base(),
            config.detection.language.clone(),
            config.detection.entities.clone(),
        );

        Ok(Self { config, store, pipeline })
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let detector: Arc<dyn Detector> = Arc::new(RuleDetector::new(&config.detection)?);

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.proxy.upstream_timeout_seconds {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| AnontexError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!("Proxying to upstream {}", config.upstream_base());
        Self::new(config, detector, client)
    }
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn proxy_handler(State(ctx): State<Arc<AppContext>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = match axum::body::to_bytes(body, ctx.config.proxy.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return AnontexError::Validation("Request body unreadable or too large.".to_string())
                .into_response();
        }
    };

    let mut request_ctx = ProxyRequestContext::new(parts.method, path);
    match ctx.pipeline.handle(&mut request_ctx, &parts.headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Periodically removes expired mappings. Expiry is already enforced on
/// read; this only reclaims space.
pub fn spawn_expiry_sweeper(store: MappingStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!("Expiry sweep removed {} mappings", removed),
                Err(e) => warn!("Expiry sweep failed: {}", e),
            }
        }
    })
}
