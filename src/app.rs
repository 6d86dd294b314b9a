use std::{sync::Arc, time::Duration};

use axum::{
    routing::{get, patch, post, put},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::ai::OpenAiClient;
use crate::api;
use crate::config::Config;
use crate::error::StartupError;
use crate::gateway::HttpGateway;
use crate::logging::init_logging;
use crate::memory_store::MemoryStore;
use crate::pg_store::PgStore;
use crate::realtime::Realtime;
use crate::service::{Collaborators, Orchestrator};
use crate::store::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/webhook", post(api::webhook))
        .route("/conversations/{id}/messages", get(api::get_messages))
        .route("/conversations/{id}/send", post(api::send_text))
        .route("/conversations/{id}/send-file", post(api::send_file))
        .route("/conversations/{id}/handoff", patch(api::patch_handoff))
        .route("/conversations/{id}/close", post(api::close_conversation))
        .route("/leads/clear", post(api::clear_leads))
        .route("/leads/{id}", patch(api::patch_lead))
        .route("/flows", get(api::list_flows).post(api::create_flow))
        .route("/flows/{id}", get(api::get_flow).put(api::update_flow))
        .route("/flows/{id}/steps", post(api::add_step))
        .route(
            "/flows/{id}/steps/{step_id}",
            put(api::put_step).delete(api::delete_step),
        )
        .route("/flows/{id}/keywords", post(api::add_keyword))
        .route(
            "/flows/{id}/keywords/{rule_id}",
            axum::routing::delete(api::delete_keyword),
        )
        .route("/flows/{id}/activate", post(api::activate_flow))
        .route("/flows/{id}/validate", get(api::validate_flow))
        .route("/debug/buffer/{phone}", get(api::debug_buffer))
        .route("/ws", get(api::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>, StartupError> {
    if config.uses_memory_store() {
        tracing::warn!("using the in-memory store; data is lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(crate::error::StoreError::from)?;
    let store = PgStore::new(db);
    store.migrate().await?;
    tracing::info!("database migrations applied");
    Ok(Arc::new(store))
}

pub async fn run() -> Result<(), StartupError> {
    let _ = dotenvy::dotenv();
    let config = Arc::new(Config::from_env()?);
    init_logging(config.log_format);

    let store = open_store(&config).await?;
    let http = reqwest::Client::builder()
        .timeout(config.outbound_timeout)
        .build()?;
    let gateway = Arc::new(HttpGateway::new(
        http.clone(),
        config.gateway_base_url.clone(),
        config.gateway_api_key.clone(),
    ));
    let openai = Arc::new(OpenAiClient::new(
        http,
        config.openai_api_key.clone(),
        config.openai_base_url.clone(),
        config.openai_chat_model.clone(),
        config.openai_transcribe_model.clone(),
    ));

    let orchestrator = Orchestrator::new(
        config.clone(),
        Collaborators {
            store,
            gateway,
            ai: openai.clone(),
            transcriber: openai,
        },
        Arc::new(Realtime::new()),
    );
    let suspended = orchestrator.handoff().warm().await?;
    tracing::info!(suspended, "hand-off state loaded");

    let sweeper = orchestrator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper.rate_limiter().cleanup();
            let phones = sweeper.outbound().prune();
            tracing::trace!(phones, "outbound log swept");
        }
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        %addr,
        instances = ?config.instances,
        echo_strategy = ?config.echo_strategy,
        "lead chat server listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
