use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rusqlite::Connection;
use tracing::info;

use haven_auth::{PrincipalStore, TokenVerifier};
use haven_core::config::HavenConfig;
use haven_core::error::GatewayError;
use haven_llm::provider::ProviderAdapter;
use haven_llm::{ContextGuard, ModelRegistry, Tokenizer};
use haven_store::ConversationStore;
use haven_stream::{SessionCache, StreamCoordinator};
use haven_worker::{JobQueue, SessionJanitor, WorkerEngine};

mod app;
mod error;
mod http;
mod middleware;

#[derive(Parser)]
#[command(name = "haven-gateway", about = "Haven RAG platform gateway")]
struct Args {
    /// Path to haven.toml (default: ~/.haven/haven.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("HAVEN_CONFIG").ok());

    // Configuration errors are fatal: a misconfigured gateway must not serve.
    let config = HavenConfig::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("config: {}", e))?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Web-side stores share nothing with the worker's connections; the two
    // sides only meet at SQLite's row locks.
    let principals_conn = open_db(&config.database.path)?;
    haven_auth::db::init_db(&principals_conn).map_err(GatewayError::from)?;
    let principals = PrincipalStore::new(principals_conn);

    let store_conn = open_db(&config.database.path)?;
    haven_store::db::init_db(&store_conn).map_err(GatewayError::from)?;
    let store = Arc::new(ConversationStore::new(store_conn));

    let queue = JobQueue::new(open_db(&config.database.path)?)
        .map_err(|e| anyhow::anyhow!("queue: {}", e))?;

    let tokenizer = Tokenizer::new().map_err(|e| anyhow::anyhow!("tokenizer: {}", e))?;
    let adapters = build_adapters(&config, &tokenizer)?;
    if adapters.is_empty() {
        anyhow::bail!("config: no providers are enabled");
    }

    let registry = ModelRegistry::new(
        adapters,
        config.router.model_precedence.clone(),
        Duration::from_secs(config.router.refresh_interval_seconds),
    );
    registry.refresh().await;

    let cache = Arc::new(SessionCache::new());
    let coordinator = StreamCoordinator::new(
        cache.clone(),
        queue.clone(),
        Duration::from_secs(config.stream.wallclock_cap_seconds),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(registry.clone().run_refresh_loop(shutdown_rx.clone()));

    // The persistence worker gets its own synchronous connections.
    let worker_store_conn = open_db(&config.database.path)?;
    haven_store::db::init_db(&worker_store_conn).map_err(GatewayError::from)?;
    let worker = WorkerEngine::new(
        JobQueue::new(open_db(&config.database.path)?)
            .map_err(|e| anyhow::anyhow!("worker queue: {}", e))?,
        Arc::new(ConversationStore::new(worker_store_conn)),
        Some(cache.clone() as Arc<dyn SessionJanitor>),
        config.persistence.retry.clone(),
        Duration::from_millis(config.persistence.poll_interval_ms),
    );
    tokio::spawn(worker.run(shutdown_rx));

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState {
        verifier: TokenVerifier::new(&config.jwt),
        principals,
        store,
        registry,
        guard: ContextGuard::new(config.context.output_headroom_tokens),
        coordinator,
        queue,
        idp_client: reqwest::Client::new(),
        config,
    });
    let router = app::build_router(state);

    let addr = format!("{}:{}", bind, port);
    info!("haven gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}

fn open_db(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    // WAL lets the async handlers and the sync worker write concurrently.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn build_adapters(
    config: &HavenConfig,
    tokenizer: &Arc<Tokenizer>,
) -> anyhow::Result<Vec<Arc<dyn ProviderAdapter>>> {
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
    for (id, provider) in &config.providers {
        if !provider.enabled {
            continue;
        }
        let adapter: Arc<dyn ProviderAdapter> = match id.as_str() {
            "local" => Arc::new(haven_llm::local::LocalProvider::new(
                provider,
                tokenizer.clone(),
            )),
            "anthropic" => Arc::new(haven_llm::anthropic::AnthropicProvider::new(
                provider,
                tokenizer.clone(),
            )),
            "openai" => Arc::new(haven_llm::openai::OpenAiProvider::new(
                provider,
                tokenizer.clone(),
            )),
            other => anyhow::bail!("config: unknown provider id '{}'", other),
        };
        info!(provider = %id, "provider enabled");
        adapters.push(adapter);
    }
    Ok(adapters)
}
