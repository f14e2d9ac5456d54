mod artifacts;
mod broker;
mod cache;
mod config;
mod convert;
mod errors;
mod fetcher;
mod llm_client;
mod pipeline;
mod resume;
mod routes;
mod sessions;
mod state;
mod store;
mod structured;
mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::artifacts::S3ArtifactStore;
use crate::broker::worker::WorkerPool;
use crate::broker::TaskBroker;
use crate::cache::ResponseCache;
use crate::config::{Config, StoreBackend};
use crate::convert::CloudConvertClient;
use crate::fetcher::{Fetcher, HttpTransport};
use crate::llm_client::OpenAiClient;
use crate::pipeline::{Orchestrator, PipelineExecutor};
use crate::routes::build_router;
use crate::sessions::SessionStore;
use crate::state::AppState;
use crate::store::{KvStore, MemoryStore, RedisStore};
use crate::tasks::TaskTracker;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting resumeflow v{}", env!("CARGO_PKG_VERSION"));

    // Key-value namespace: cache, sessions, tasks, pipelines and the queue
    let store: Arc<dyn KvStore> = match config.store_backend {
        StoreBackend::Redis => {
            let client = redis::Client::open(config.redis_url.clone())?;
            Arc::new(RedisStore::connect(&client).await?)
        }
        StoreBackend::Memory => {
            info!("Using the in-process store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let artifacts = Arc::new(S3ArtifactStore::new(s3, config.s3_bucket.clone()));
    info!("S3 artifact store initialized (bucket: {})", config.s3_bucket);

    // External collaborators
    let llm = Arc::new(OpenAiClient::new(
        config.openai_api_key.clone(),
        config.openai_base_url.clone(),
        config.external_timeout,
    )?);
    let converter = Arc::new(CloudConvertClient::new(
        config.cloudconvert_api_key.clone(),
        config.cloudconvert_base_url.clone(),
        config.external_timeout,
    )?);
    let transport = Arc::new(HttpTransport::new(config.external_timeout)?);
    info!("LLM client initialized (model: {})", config.llm_model_name);

    let cache = ResponseCache::new(store.clone(), config.cache_settings());
    let fetcher = Fetcher::new(transport, cache.clone(), config.fetcher_settings());

    // Broker, tracker and pipeline services
    let broker_settings = config.broker_settings();
    let tracker = TaskTracker::new(store.clone(), broker_settings.task_ttl);
    let broker = TaskBroker::new(store.clone(), tracker.clone(), broker_settings);
    let orchestrator = Orchestrator::new(store.clone(), broker.clone(), artifacts.clone());
    let sessions = SessionStore::new(store.clone());

    let executor = Arc::new(PipelineExecutor::new(
        cache,
        llm,
        config.llm_settings(),
        fetcher,
        artifacts,
        converter,
    ));

    // Anything claimed but never acknowledged by a previous run goes back on the queue
    broker.recover_in_flight().await?;
    let workers = Arc::new(WorkerPool::new(
        broker,
        executor,
        config.worker_concurrency,
    ))
    .spawn();

    // Build app state
    let state = AppState {
        orchestrator,
        tracker,
        sessions,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state).layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, waiting for in-flight tasks");
    workers.shutdown_and_join().await;
    info!("Worker pool stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "resumeflow-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
