//! HTTP ingestion, query and live-update server for crewtrace.

pub mod broadcast;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use axum::routing::{get, post};
use axum::Router;
use crewtrace_config::EngineConfig;
use crewtrace_monitor::{Ingestor, StepStore};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::services::analysis::AnalysisService;

pub struct ServerState {
    pub config: EngineConfig,
    pub ingestor: Ingestor,
    pub broadcaster: Broadcaster,
    pub analysis: AnalysisService,
    pub http: reqwest::Client,
}

impl ServerState {
    pub fn new(config: EngineConfig, store: Arc<StepStore>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.replay.timeout_secs))
            .build()?;

        Ok(Self {
            ingestor: Ingestor::with_policy(store, config.policy.clone()),
            broadcaster: Broadcaster::new(config.broadcaster.queue_capacity),
            analysis: AnalysisService::new(config.policy.clone(), config.analysis.cache_capacity),
            http,
            config,
        })
    }

    pub fn store(&self) -> &StepStore {
        self.ingestor.store()
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Builds the application router.
pub fn router(state: Arc<ServerState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                version = ?req.version(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let logged_routes = Router::new()
        .route("/event", post(handlers::events::ingest))
        .route("/api/event", post(handlers::events::ingest))
        .route("/debate/progress", post(handlers::events::progress))
        .route("/runs", get(handlers::runs::list))
        .route("/run/{id}", get(handlers::runs::get))
        .route("/run/{id}/steps", get(handlers::runs::steps))
        .route("/run/{id}/trace", get(handlers::runs::trace))
        .route("/run/{id}/coordination-analysis", get(handlers::runs::analysis))
        .route("/step/{id}", get(handlers::steps::get))
        .route("/step/{id}/replay", post(handlers::steps::replay))
        .route("/ws", get(handlers::live::ws_handler))
        .layer(trace_layer);

    Router::new()
        .merge(logged_routes)
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}
