use std::sync::Arc;

use anyhow::Result;

use alim_backend::api::{cors_layer, create_router, AppState};
use alim_backend::config::Settings;
use alim_backend::llm::{OpenAiChatModel, OpenAiClient};
use alim_backend::logging;
use alim_backend::pipeline::AlimPipeline;
use alim_backend::prompt::PromptBuilder;
use alim_backend::rag::embeddings::EmbeddingGenerator;
use alim_backend::rag::{ContextRetriever, RagEngine};
use alim_backend::session::SessionStore;
use alim_backend::voice::VoiceService;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init("info,tower_http=info");

    let settings = Settings::load()?;

    tracing::info!("Session memory directory: {}", settings.memory_dir.display());
    tracing::info!("Connecting to Qdrant: {}", settings.vector_store.url);
    tracing::info!("Chat model: {} via {}", settings.chat.model, settings.openai.base_url);

    let openai = OpenAiClient::new(settings.openai.base_url.clone(), settings.openai.api_key.clone());
    if !openai.has_api_key() {
        tracing::warn!("No OpenAI API key configured; generation and voice requests will fail");
    } else {
        match openai.health_check().await {
            Ok(true) => tracing::info!("OpenAI API reachable"),
            Ok(false) => tracing::warn!("OpenAI API rejected the model listing request"),
            Err(e) => tracing::warn!("OpenAI API unreachable: {}", e),
        }
    }

    let sessions = Arc::new(SessionStore::new(&settings.memory_dir)?);

    let retriever = match init_retriever(&settings, &openai).await {
        Ok(engine) => {
            tracing::info!("RAG engine initialized successfully");
            Some(Arc::new(engine) as Arc<dyn ContextRetriever>)
        }
        Err(e) => {
            tracing::warn!("RAG engine initialization failed (continuing without context): {}", e);
            None
        }
    };

    let model = Arc::new(OpenAiChatModel::new(
        openai.clone(),
        settings.chat.model.clone(),
        settings.chat.temperature,
    ));

    let pipeline = AlimPipeline::new(
        sessions,
        retriever,
        model,
        PromptBuilder::new(settings.chat.history_token_budget),
        settings.chat.top_k,
    );

    let voice = openai
        .has_api_key()
        .then(|| VoiceService::new(openai.clone(), settings.voice.clone()));

    let state = Arc::new(AppState {
        pipeline: Arc::new(pipeline),
        voice,
    });

    let app = create_router(state).layer(cors_layer(&settings.server.cors_origins));

    let listener = tokio::net::TcpListener::bind(settings.bind_addr()?).await?;
    tracing::info!("Alim API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn init_retriever(settings: &Settings, openai: &OpenAiClient) -> Result<RagEngine> {
    let embeddings = EmbeddingGenerator::from_settings(&settings.embedding, openai)?;
    RagEngine::connect(
        embeddings,
        &settings.vector_store.url,
        &settings.vector_store.collection,
    )
    .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
