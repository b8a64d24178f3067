mod config;
mod handlers;
mod health;
mod request_config;

use axum::routing::{get, post};
use axum::Router;
use backend_adapter::HttpBackendAdapter;
use config::ProxyConfig;
use coordinator::Coordinator;
use fingerprint::CanonicalizationStrategy;
use meta_store::MetaStore;
use proxy_core::time::now_secs;
use proxy_core::BackendAdapter;
use slot_acquirer::SlotAcquirer;
use slot_table::SlotTable;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Handles shared across every request by axum's `State` extractor.
pub struct AppState {
    pub config: ProxyConfig,
    pub coordinator: Coordinator,
    pub backends: HashMap<String, Arc<dyn BackendAdapter>>,
    pub started_at: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::from_env()?;
    init_logging(&config.log_level);

    let slot_specs: Vec<(String, usize)> = config
        .backends
        .iter()
        .map(|b| (b.backend_id.clone(), b.n_slots))
        .collect();
    let table = Arc::new(SlotTable::new(&slot_specs));
    let meta_store = Arc::new(MetaStore::new(config.metadata_dir.clone())?);

    let mut backends: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
    for spec in &config.backends {
        let adapter = Arc::new(HttpBackendAdapter::new(
            spec.backend_id.clone(),
            spec.base_url.clone(),
            spec.n_slots,
            config.request_timeout,
        )?);
        if let Err(err) = adapter.model_id().await {
            tracing::warn!(backend_id = %spec.backend_id, error = %err, "startup probe of backend model id failed; continuing");
        }
        backends.insert(spec.backend_id.clone(), adapter as Arc<dyn BackendAdapter>);
    }

    let acquirer = Arc::new(SlotAcquirer::new(
        table.clone(),
        meta_store.clone(),
        backends.clone(),
        config.pinned_keys.clone(),
    ));
    let coordinator = Coordinator::new(
        table,
        meta_store,
        acquirer,
        backends.clone(),
        config.model_id.clone(),
        CanonicalizationStrategy::default(),
    );

    let state = Arc::new(AppState {
        started_at: now_secs(),
        config: config.clone(),
        coordinator,
        backends,
    });

    let app = Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    tracing::info!(port = config.listen_port, "slotcache-proxy listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
