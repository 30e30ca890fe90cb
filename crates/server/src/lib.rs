pub mod admin;
pub mod auth;
pub mod handler;
pub mod logger;
pub mod proxy;
pub mod streaming;

use arc_swap::ArcSwap;
use axum::{Router, routing::get};
use relay_core::config::AppConfig;
use relay_core::snapshot::MAX_SNAPSHOT_BYTES;
use relay_core::upstream::RuntimeState;
use relay_plugin::PluginRegistry;
use relay_store::{AccessLogWriter, JsonlMirror, SideStore};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<AppConfig>>,
    pub runtime: Arc<ArcSwap<RuntimeState>>,
    pub registry: Arc<PluginRegistry>,
    pub writer: AccessLogWriter,
    pub mirror: Arc<JsonlMirror>,
    pub body_store: Arc<SideStore>,
    pub header_store: Arc<SideStore>,
    pub http: reqwest::Client,
    pub start_time: Instant,
}

impl AppState {
    /// Assemble the state for one worker. `log_root` holds the access
    /// database and the body/header/mirror stores.
    pub fn build(config: AppConfig, log_root: &std::path::Path) -> Result<Self, anyhow::Error> {
        let runtime = RuntimeState::from_config(&config)?;
        let registry = PluginRegistry::with_resolver(relay_translator::catalog);

        let body_log = config.logging.body.clone();
        let writer = AccessLogWriter::open(&log_root.join("access.db"));
        let mirror = JsonlMirror::new(log_root.join("logs"));
        let body_store = SideStore::new(
            log_root.join("logs").join("bodies"),
            body_log.max_size,
            body_log.enabled,
        );
        let header_store = SideStore::new(
            log_root.join("logs").join("headers"),
            body_log.max_size.max(16 * 1024),
            body_log.enabled,
        );

        // per-attempt timeouts are armed separately; redirects stay with
        // the client
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            runtime: Arc::new(ArcSwap::from_pointee(runtime)),
            registry: Arc::new(registry),
            writer,
            mirror: Arc::new(mirror),
            body_store: Arc::new(body_store),
            header_store: Arc::new(header_store),
            http,
            start_time: Instant::now(),
        })
    }

    /// Swap in a freshly loaded config and rebuild the runtime upstream
    /// records. Breaker counters restart healthy by design.
    pub fn apply_config(&self, config: AppConfig) {
        match RuntimeState::from_config(&config) {
            Ok(runtime) => {
                self.runtime.store(Arc::new(runtime));
                self.config.store(Arc::new(config));
            }
            Err(e) => {
                tracing::error!(error = %e, "config swap failed; keeping previous runtime state");
            }
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .config
        .load()
        .body_parser_limit
        .unwrap_or(MAX_SNAPSHOT_BYTES);

    Router::new()
        .route("/health", get(admin::health))
        .route("/api/stats", get(admin::stats))
        .route("/api/logs", get(admin::logs))
        .fallback(handler::proxy_entry)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
