// src/config/mod.rs
// Central configuration for the pipeline, composed of small domain configs
// the way the teacher's `config::MiraConfig` aggregates `llm`/`memory`/
// `server`. One process-wide `CONFIG` static, loaded once from the
// environment (§6.5).

pub mod helpers;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref CONFIG: PipelineConfig = PipelineConfig::from_env();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub vector_store: VectorStoreConfig,
    pub llm: LlmConfig,
    pub relational: RelationalConfig,
    pub embedding: EmbeddingConfig,
    pub conversation: ConversationConfig,
    pub search: SearchConfig,
    pub context: ContextConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            vector_store: VectorStoreConfig::from_env(),
            llm: LlmConfig::from_env(),
            relational: RelationalConfig::from_env(),
            embedding: EmbeddingConfig::from_env(),
            conversation: ConversationConfig::from_env(),
            search: SearchConfig::from_env(),
            context: ContextConfig::from_env(),
            cache: CacheConfig::from_env(),
            server: ServerConfig::from_env(),
        }
    }
}

/// §6.5 vector store section + §4.2 collection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub https: bool,
    pub timeout_secs: u64,
    pub collection_name: String,
    pub vector_size: u64,
    pub hnsw_m: u64,
    pub hnsw_ef_construct: u64,
    pub indexing_threshold: u64,
    pub max_retries: u32,
}

impl VectorStoreConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            host: env_or("QDRANT_HOST", "localhost"),
            port: env_parsed("QDRANT_PORT", 6334),
            api_key: env_opt("QDRANT_API_KEY"),
            https: env_bool("QDRANT_HTTPS", false),
            timeout_secs: env_parsed("QDRANT_TIMEOUT", 30),
            collection_name: env_or("QDRANT_COLLECTION_NAME", "task_manager"),
            vector_size: env_parsed("QDRANT_VECTOR_SIZE", 768),
            hnsw_m: 16,
            hnsw_ef_construct: 100,
            indexing_threshold: 10_000,
            max_retries: env_parsed("QDRANT_MAX_RETRIES", 3),
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// §6.5 LLM section + §4.3 backend selection/timeouts/retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub ollama_api_url: String,
    pub ollama_embedding_model: String,
    pub ollama_llm_model: String,
    pub ollama_fast_llm_model: String,
    pub use_openai: bool,
    pub openai_api_key: Option<String>,
    pub completion_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
    pub completion_max_retries: u32,
    pub embedding_max_retries: u32,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            ollama_api_url: env_or("OLLAMA_API_URL", "http://localhost:11434"),
            ollama_embedding_model: env_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            ollama_llm_model: env_or("OLLAMA_LLM_MODEL", "llama3.1"),
            ollama_fast_llm_model: env_or("OLLAMA_FAST_LLM_MODEL", "llama3.1:8b"),
            use_openai: env_bool("USE_OPENAI", false),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            completion_timeout_secs: 120,
            embedding_timeout_secs: 30,
            completion_max_retries: 2,
            embedding_max_retries: 3,
        }
    }
}

/// §6.5 relational store section. The Pipeline never opens this connection
/// itself (§1 Out of scope: "the relational database") — these values exist
/// purely so operators can point the external CRUD service at the right
/// database; the Pipeline only talks to that service's HTTP surface (§6.2),
/// whose base URL is `TASK_SERVICE_BASE_URL` (not part of the spec's
/// recognised set, but required to make §6.2 callable at all).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    pub db_host: String,
    pub db_port: u16,
    pub db_username: String,
    pub db_name: String,
    pub task_service_base_url: String,
}

impl RelationalConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            db_host: env_or("DB_HOST", "localhost"),
            db_port: env_parsed("DB_PORT", 5432),
            db_username: env_or("DB_USERNAME", "postgres"),
            db_name: env_or("DB_NAME", "task_manager"),
            task_service_base_url: env_or("TASK_SERVICE_BASE_URL", "http://localhost:4000"),
        }
    }
}

/// §4.1 embedding client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub max_chars: usize,
    pub cache_ttl_secs: u64,
    pub batch_size: usize,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            max_chars: env_parsed("EMBED_MAX_CHARS", 32_000),
            cache_ttl_secs: env_parsed("EMBED_CACHE_TTL_SECS", 3_600),
            batch_size: env_parsed("EMBED_BATCH_SIZE", 10),
        }
    }
}

/// §3.3 conversation history bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub max_msg: usize,
    pub summarize_threshold: usize,
    pub keep_recent: usize,
    pub session_ttl_secs: u64,
}

impl ConversationConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            max_msg: env_parsed("CONV_MAX_MSG", 10),
            summarize_threshold: env_parsed("CONV_SUMMARIZE_THRESHOLD", 8),
            keep_recent: env_parsed("CONV_KEEP_RECENT", 3),
            session_ttl_secs: env_parsed("CONV_SESSION_TTL_SECS", 1_800),
        }
    }
}

/// §4.8 Searcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub rrf_k: f64,
    pub bm25_k1: f64,
    pub bm25_b: f64,
    pub bm25_scroll_limit: usize,
    pub per_query_limit: usize,
}

impl SearchConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            rrf_k: env_parsed("SEARCH_RRF_K", 60.0),
            bm25_k1: 1.2,
            bm25_b: 0.75,
            bm25_scroll_limit: env_parsed("SEARCH_BM25_SCROLL_LIMIT", 60),
            per_query_limit: env_parsed("SEARCH_PER_QUERY_LIMIT", 10),
        }
    }
}

/// §4.9 Context Processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub mmr_lambda: f64,
    pub mmr_selection_size: usize,
    pub rerank_size: usize,
    pub max_tokens: usize,
    pub grounding_threshold: f64,
}

impl ContextConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            mmr_lambda: env_parsed("CONTEXT_MMR_LAMBDA", 0.85),
            mmr_selection_size: 5,
            rerank_size: 10,
            max_tokens: env_parsed("CONTEXT_MAX_TOKENS", 3_000),
            grounding_threshold: 0.30,
        }
    }
}

/// §4.13 response cache + §4.3 LLM-call cache + §9 open-question flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub llm_cache_ttl_secs: u64,
    pub response_cache_ttl_secs: u64,
    pub cache_key_includes_session: bool,
    pub llm_cache_key_includes_context: bool,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            llm_cache_ttl_secs: env_parsed("LLM_CACHE_TTL_SECS", 600),
            response_cache_ttl_secs: env_parsed("RESPONSE_CACHE_TTL_SECS", 300),
            cache_key_includes_session: env_bool("CACHE_KEY_INCLUDES_SESSION", false),
            llm_cache_key_includes_context: env_bool("LLM_CACHE_KEY_INCLUDES_CONTEXT", false),
        }
    }
}

/// HTTP transport (§6.1). Out of scope per §1 beyond exposing the two routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        use helpers::*;
        Self {
            host: env_or("PIPELINE_HOST", "0.0.0.0"),
            port: env_parsed("PIPELINE_PORT", 8080),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
