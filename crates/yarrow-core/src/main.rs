use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use yarrow_core::agent::{Agent, AgentHandles, Preset};
use yarrow_core::config::Config;
use yarrow_core::interface::NullInterface;
use yarrow_core::llm::HttpCompletionClient;
use yarrow_core::memory::archival::InMemoryArchivalStorage;
use yarrow_core::memory::recall::InMemoryRecallStorage;
use yarrow_core::memory::HttpEmbedder;
use yarrow_core::registry::{AgentRegistry, InMemoryMetadataStore};
use yarrow_core::server::{router, ServerState};
use yarrow_core::tools::ToolRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "yarrow=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Yarrow starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!("Configuration loaded");
    info!("  Model endpoint: {}", config.llm.model_endpoint);
    info!("  Model: {}", config.llm.model);
    info!("  Context window: {}", config.llm.context_window);

    let transport = Arc::new(HttpCompletionClient::new(&config.llm)?);
    let embedder = Arc::new(HttpEmbedder::new(&config.embedding));

    // Seed the default agent for the anonymous owner
    let owner_id = Uuid::nil();
    let registry = Arc::new(AgentRegistry::new());
    let agent = Agent::create(
        Uuid::new_v4(),
        owner_id,
        Preset {
            name: config.preset.clone(),
            system: yarrow_core::system::DEFAULT_SYSTEM_PROMPT.to_string(),
            persona: config.persona.clone(),
            human: config.human.clone(),
        },
        config.llm.clone(),
        &config.embedding,
        ToolRegistry::with_builtin_tools(),
        AgentHandles {
            transport,
            interface: Arc::new(NullInterface),
            recall_storage: Arc::new(InMemoryRecallStorage::new()),
            archival_storage: Arc::new(InMemoryArchivalStorage::new()),
            embedder,
        },
    )
    .await?;
    let agent_id = registry.insert(agent);
    info!("Default agent ready: {agent_id}");

    // Bearer tokens resolve to owner ids through the metadata store
    let metadata = Arc::new(InMemoryMetadataStore::new());
    match &config.api_token {
        Some(token) => metadata.register_token(token.clone(), owner_id),
        None => warn!("YARROW_API_TOKEN not set - all requests will be rejected"),
    }

    let state = Arc::new(ServerState {
        registry,
        metadata,
        chaining: config.chaining,
        max_chaining_steps: config.max_chaining_steps,
    });

    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!("Listening on port {}", config.http_port);
    axum::serve(listener, router(state)).await?;

    Ok(())
}
