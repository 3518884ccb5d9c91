use axum::{Extension, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use tenant_chat::ai::bridge::AiBridge;
use tenant_chat::ai::claude::ClaudeProvider;
use tenant_chat::ai::credentials::{InMemoryCredentialStore, PgCredentialStore, ProviderCredentialStore};
use tenant_chat::ai::openai::OpenAiProvider;
use tenant_chat::ai::registry::ModelRegistry;
use tenant_chat::ai::AiProvider;
use tenant_chat::config::{Config, StorageBackend};
use tenant_chat::services::message_pipeline::PipelineSettings;
use tenant_chat::services::{
    ChatStore, DefaultFileIngestor, InMemoryChatStore, InMemoryQuotaTracker, MessagePipeline, PgChatStore,
    PgQuotaTracker, QuotaTracker,
};
use tenant_chat::{db, handlers, middleware, AppState};

type Backends = (
    Option<sqlx::PgPool>,
    Arc<dyn ChatStore>,
    Arc<dyn QuotaTracker>,
    Arc<dyn ProviderCredentialStore>,
);

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (db_pool, chat_store, quota, credentials) = match build_backends(&config).await {
        Ok(backends) => backends,
        Err(e) => {
            tracing::error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let providers: Vec<Arc<dyn AiProvider>> = vec![
        Arc::new(ClaudeProvider::new(&config.anthropic_base_url, config.ai_request_timeout)) as Arc<dyn AiProvider>,
        Arc::new(OpenAiProvider::new(&config.openai_base_url, config.ai_request_timeout)) as Arc<dyn AiProvider>,
    ];
    let registry = ModelRegistry::from_config(&config.models, config.default_model.as_deref());
    let bridge = match AiBridge::new(registry, providers, credentials.clone(), config.ai_stream_idle_timeout) {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            tracing::error!("Invalid model catalog: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "AI bridge ready: {} model(s), default {}",
        bridge.registry().models().len(),
        bridge.registry().default_model()
    );

    let pipeline = Arc::new(MessagePipeline::new(
        chat_store.clone(),
        quota.clone(),
        Arc::new(DefaultFileIngestor::new(config.max_upload_bytes)),
        bridge.clone(),
        PipelineSettings {
            history_limit: config.chat_history_limit,
            flush_interval: config.stream_flush_interval,
            max_tokens: config.ai_max_tokens,
            system_prompt: config.system_prompt.clone(),
        },
    ));

    let bind_addr = config.bind_addr.clone();
    let max_upload_bytes = config.max_upload_bytes;
    let shared_state = Arc::new(AppState {
        config,
        db_pool,
        chat_store,
        quota,
        credentials,
        bridge,
        pipeline,
    });

    // Build our application with all routes and shared state
    let app = Router::new()
        .merge(handlers::chat::chat_routes(max_upload_bytes))
        .merge(handlers::quota::quota_routes())
        .merge(handlers::keys::key_routes())
        .route("/api/status", axum::routing::get(api_status))
        .layer(axum::middleware::from_fn(middleware::logging::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Server listening on {}", bind_addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn build_backends(config: &Config) -> Result<Backends, Box<dyn std::error::Error>> {
    match config.storage {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; chats, quotas and keys are lost on restart");
            Ok((
                None,
                Arc::new(InMemoryChatStore::new()) as Arc<dyn ChatStore>,
                Arc::new(InMemoryQuotaTracker::new()) as Arc<dyn QuotaTracker>,
                Arc::new(InMemoryCredentialStore::new()) as Arc<dyn ProviderCredentialStore>,
            ))
        }
        StorageBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or("DATABASE_URL must be set")?;
            let pool = db::create_pool(url, config.db_max_connections).await?;
            tracing::info!("Database ready");
            Ok((
                Some(pool.clone()),
                Arc::new(PgChatStore::new(pool.clone())) as Arc<dyn ChatStore>,
                Arc::new(PgQuotaTracker::new(pool.clone())) as Arc<dyn QuotaTracker>,
                Arc::new(PgCredentialStore::new(pool)) as Arc<dyn ProviderCredentialStore>,
            ))
        }
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,tenant_chat=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,tenant_chat=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for log aggregation
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;

    Ok(())
}

async fn api_status(Extension(state): Extension<Arc<AppState>>) -> axum::response::Json<serde_json::Value> {
    use serde_json::json;

    let db_status = match &state.db_pool {
        Some(pool) => match sqlx::query("SELECT 1").fetch_one(pool).await {
            Ok(_) => "healthy",
            Err(_) => "unhealthy",
        },
        None => "in_memory",
    };

    let registry = state.bridge.registry();
    let models: Vec<_> = registry
        .models()
        .into_iter()
        .map(|spec| {
            json!({
                "id": spec.id,
                "provider": spec.provider,
                "supports_images": spec.supports_images,
            })
        })
        .collect();

    axum::response::Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "database": db_status,
        },
        "providers": state.bridge.providers(),
        "models": models,
        "default_model": registry.default_model(),
    }))
}
