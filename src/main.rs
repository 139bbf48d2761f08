// src/main.rs
//! Process entrypoint: wires C1-C13 from `CONFIG`, then either serves the
//! HTTP surface (§6.1) or runs a one-shot indexing command. Grounded on the
//! teacher's `bin/mira.rs` clap-driven entrypoint shape.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use task_rag_pipeline::actions::ActionExecutor;
use task_rag_pipeline::config::CONFIG;
use task_rag_pipeline::context::ContextProcessor;
use task_rag_pipeline::conversation::ConversationStore;
use task_rag_pipeline::embedding::EmbeddingClient;
use task_rag_pipeline::entities::service::HttpEntityService;
use task_rag_pipeline::generator::Generator;
use task_rag_pipeline::http::router;
use task_rag_pipeline::indexer::Indexer;
use task_rag_pipeline::intent::IntentClassifier;
use task_rag_pipeline::llm::cached::CachedLlmClient;
use task_rag_pipeline::llm::hosted::HostedLlmClient;
use task_rag_pipeline::llm::local::LocalLlmClient;
use task_rag_pipeline::llm::LlmClient;
use task_rag_pipeline::orchestrator::Orchestrator;
use task_rag_pipeline::resolver::EntityResolver;
use task_rag_pipeline::search::Searcher;
use task_rag_pipeline::vectorstore::qdrant::QdrantVectorStore;

#[derive(Parser)]
#[command(name = "task-rag-pipeline", about = "Task-management RAG and action pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP surface (default).
    Serve,
    /// Run a full reindex of all entities and exit.
    IndexAll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = &*CONFIG;

    let llm_client: Arc<dyn LlmClient> = if config.llm.use_openai {
        Arc::new(HostedLlmClient::new(&config.llm))
    } else {
        Arc::new(LocalLlmClient::new(&config.llm))
    };
    let cached_llm: Arc<dyn LlmClient> = Arc::new(CachedLlmClient::new(llm_client.clone(), &config.cache));

    let embedding_client = Arc::new(EmbeddingClient::new(
        Arc::new(EmbeddingBackendAdapter { llm: llm_client }),
        config.embedding.clone(),
    ));

    let vector_store = Arc::new(QdrantVectorStore::connect(config.vector_store.clone()).await?);
    let entities = Arc::new(HttpEntityService::new(config.relational.task_service_base_url.clone()));

    let indexer = Arc::new(Indexer::new(entities.clone(), embedding_client.clone(), vector_store.clone()));
    let conversation = Arc::new(ConversationStore::new(cached_llm.clone(), config.conversation.clone()));
    let classifier = Arc::new(IntentClassifier::new(cached_llm.clone()));
    let searcher = Arc::new(Searcher::new(embedding_client.clone(), vector_store.clone(), config.search.clone()));
    let context = Arc::new(ContextProcessor::new(config.context.clone()));
    let generator = Arc::new(Generator::new(cached_llm.clone()));
    let resolver = Arc::new(EntityResolver::new(entities.clone()));
    let actions = Arc::new(ActionExecutor::new(
        cached_llm.clone(),
        searcher.clone(),
        resolver.clone(),
        entities.clone(),
        indexer.clone(),
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::IndexAll => {
            let stats = indexer.index_all().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Serve => {
            let orchestrator = Arc::new(Orchestrator::new(
                conversation,
                classifier,
                searcher,
                context,
                generator,
                actions,
                &config.cache,
            ));

            let app = router(orchestrator);
            let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
            tracing::info!("listening on {}", config.server.bind_address());
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}

/// C1's embedding network call and C3's LLM completion share a backend in
/// this deployment (§4.3: "may share backend with C1"); this adapter lets
/// whichever `LlmClient` is configured (local or hosted) satisfy C1's
/// narrower `EmbeddingBackend` trait.
struct EmbeddingBackendAdapter {
    llm: Arc<dyn LlmClient>,
}

#[async_trait::async_trait]
impl task_rag_pipeline::embedding::EmbeddingBackend for EmbeddingBackendAdapter {
    async fn embed_raw(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.llm.embed(text, None).await
    }

    fn dimension(&self) -> usize {
        CONFIG.vector_store.vector_size as usize
    }
}
