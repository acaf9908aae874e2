//! PACE API server
//!
//! Serves the single active conversation for the configured persona over
//! HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pace::config::{Config, MemoryBackendKind, PersonaLibrary};
use pace::conversation::{ChatLog, Session};
use pace::llm::{LlmClient, RateLimiter, RetryPolicy};
use pace::memory::{Mem0Backend, MemoryGateway, Reranker, SqliteBackend};
use pace::providers::{CompletionProvider, Provider};
use pace::routes::{self, AppState};
use pace::ConversationEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    let default_filter = if config.debug {
        "pace=debug,tower_http=debug"
    } else {
        "pace=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let settings = &config.settings;

    let personas = Arc::new(PersonaLibrary::new(&settings.persona.dir));
    let persona = personas
        .load(&settings.persona.name, &settings.persona.user_name)
        .await
        .with_context(|| format!("failed to load persona '{}'", settings.persona.name))?;
    tracing::info!(persona = %persona.character_name, user = %persona.user_name, "Persona loaded");

    let provider: Arc<dyn CompletionProvider> = Arc::new(Provider::from_settings(&settings.llm, &config)?);
    let llm = LlmClient::new(
        provider,
        Arc::new(RateLimiter::new(settings.rate_limit.clone())),
        RetryPolicy::from_settings(&settings.retry),
    );
    tracing::info!(provider = llm.provider_name(), model = %settings.llm.model, "LLM provider ready");

    let user_id = persona.user_name.clone();
    let agent_id = persona.key.clone();
    let memory = match settings.memory.backend {
        MemoryBackendKind::Sqlite => {
            let path = config.memory_db_path();
            let backend = SqliteBackend::new(&path, user_id.as_str(), agent_id.as_str())
                .await
                .with_context(|| format!("failed to open memory database {}", path.display()))?;
            MemoryGateway::new(Arc::new(backend))
        }
        MemoryBackendKind::Mem0 => {
            let api_key = settings
                .memory
                .mem0_api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            let backend = Mem0Backend::new(
                settings.memory.mem0_url.as_str(),
                api_key,
                user_id.as_str(),
                agent_id.as_str(),
                Duration::from_secs(settings.engine.persist_timeout_secs.max(settings.engine.recall_timeout_secs)),
            )?
            .with_rerank(settings.memory.mem0_rerank);
            MemoryGateway::new(Arc::new(backend))
        }
        MemoryBackendKind::Disabled => MemoryGateway::disabled(),
    };
    let memory = match (&settings.memory.rerank_url, memory.is_enabled()) {
        (Some(url), true) => {
            let reranker = Reranker::new(url.as_str(), Duration::from_secs(settings.engine.recall_timeout_secs))?;
            tracing::info!(url = reranker.base_url(), "Memory reranking enabled");
            memory.with_reranker(reranker)
        }
        _ => memory,
    };
    tracing::info!(backend = memory.backend_name(), "Memory gateway ready");

    let chat_log = Arc::new(ChatLog::new(&config.data_dir, &user_id, &agent_id));
    if let Err(e) = chat_log.backup().await {
        tracing::warn!(error = %e, "Chat log backup failed");
    }
    let history = match chat_log.load_turns().await {
        Ok(turns) => turns,
        Err(e) => {
            tracing::warn!(error = %e, "Could not restore chat log, starting fresh");
            Vec::new()
        }
    };
    tracing::info!(turns = history.len(), path = %chat_log.path().display(), "Conversation restored");

    let session = Arc::new(Session::restore(history, settings.memory.max_pending_batches));
    let engine = ConversationEngine::new(Arc::new(persona), session, Arc::new(llm), memory, settings)?
        .with_chat_log(chat_log);

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(Arc::new(engine), personas));

    tracing::info!("PACE API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
