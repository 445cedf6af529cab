//! Configuration management for AskForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Vector store database (optional; without it KB retrieval is disabled)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis for guidance session state (optional; falls back to in-process state)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Query embedding configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Model providers, chat candidates and rerank
    #[serde(default)]
    pub ai: AiConfig,

    /// Retrieval-augmented answering pipeline
    #[serde(default)]
    pub rag: RagConfig,

    /// Worker pool sizes
    #[serde(default)]
    pub executors: ExecutorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Header carrying the caller's user id
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,

    /// Key prefix for namespacing
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,

    /// Default TTL in seconds
    #[serde(default = "default_redis_ttl")]
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per request
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

/// Wire protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions` with SSE streaming
    OpenAi,
    /// Ollama native `/api/chat` with NDJSON streaming
    Ollama,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Wire protocol
    pub kind: ProviderKind,

    /// Base URL, e.g. https://api.openai.com/v1 or http://localhost:11434
    pub base_url: String,

    /// Bearer token (not needed for local Ollama)
    pub api_key: Option<String>,

    /// Connect timeout in seconds
    #[serde(default = "default_provider_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout for non-streaming calls, in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// One chat model the router may call
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelCandidateConfig {
    /// Stable id used for health tracking and explicit selection
    pub id: String,

    /// Key into `ai.providers`
    pub provider: String,

    /// Model name sent to the provider
    pub model: String,

    /// Whether the model can emit reasoning ("thinking") output
    #[serde(default)]
    pub supports_thinking: bool,

    /// Lower sorts first
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub temperature: Option<f32>,

    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatModelsConfig {
    /// Candidate models in declaration order
    #[serde(default)]
    pub candidates: Vec<ModelCandidateConfig>,

    /// How long a streaming candidate may take to produce its first packet
    #[serde(default = "default_first_packet_timeout")]
    pub first_packet_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthPolicyConfig {
    /// Consecutive failures before a model is taken out of rotation
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open model stays out of rotation, in seconds
    #[serde(default = "default_open_duration")]
    pub open_duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankConfig {
    /// Rerank endpoint base URL (Cohere/Jina style `/rerank`); unset disables model reranking
    pub base_url: Option<String>,

    pub api_key: Option<String>,

    #[serde(default = "default_rerank_model")]
    pub model: String,

    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AiConfig {
    /// Providers keyed by name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub chat: ChatModelsConfig,

    #[serde(default)]
    pub health: HealthPolicyConfig,

    #[serde(default)]
    pub rerank: RerankConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntentConfig {
    /// JSON file holding the intent tree
    #[serde(default = "default_tree_path")]
    pub tree_path: String,

    /// Minimum score for an intent to take part in retrieval
    #[serde(default = "default_intent_min_score")]
    pub min_score: f32,

    /// Upper bound on intents retrieved per request, across sub-questions
    #[serde(default = "default_max_intent_count")]
    pub max_intent_count: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewriteConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_max_sub_questions")]
    pub max_sub_questions: usize,

    /// History messages handed to the rewriter
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuidanceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Minimum score for a KB node to count as an ambiguity candidate
    #[serde(default = "default_intent_min_score")]
    pub min_score: f32,

    /// Second-best / best score ratio at which two same-named nodes are ambiguous
    #[serde(default = "default_ambiguity_ratio")]
    pub ambiguity_ratio: f32,

    /// Largest clarification menu shown to the user
    #[serde(default = "default_max_options")]
    pub max_options: usize,

    /// How long an unanswered clarification survives, in seconds
    #[serde(default = "default_guidance_ttl")]
    pub state_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Chunks kept per intent after reranking (before the rerank multiplier)
    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,

    /// Over-fetch factor for the vector search
    #[serde(default = "default_search_multiplier")]
    pub search_multiplier: usize,

    /// Floor for the vector search top-k
    #[serde(default = "default_min_search_top_k")]
    pub min_search_top_k: usize,

    #[serde(default = "default_rerank_multiplier")]
    pub rerank_multiplier: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Messages kept per conversation
    #[serde(default = "default_memory_max_messages")]
    pub max_messages: usize,
}

/// A JSON-RPC MCP tool reachable over HTTP
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpToolConfig {
    /// Local id referenced by MCP intents
    pub id: String,
    /// Tool name sent in `tools/call`
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(default = "default_mcp_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default)]
    pub tools: Vec<McpToolConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RagConfig {
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub guidance: GuidanceConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Concurrent intent classifications
    #[serde(default = "default_classify_workers")]
    pub classify_workers: usize,

    /// Concurrent per-sub-question context builds
    #[serde(default = "default_context_workers")]
    pub context_workers: usize,

    /// Concurrent KB search + rerank units
    #[serde(default = "default_kb_workers")]
    pub kb_workers: usize,

    /// Concurrent provider streams
    #[serde(default = "default_stream_workers")]
    pub stream_workers: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_user_header() -> String { "X-User-ID".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_redis_prefix() -> String { "askforge".to_string() }
fn default_redis_ttl() -> u64 { 1800 }
fn default_embedding_provider() -> String { "mock".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_provider_connect_timeout() -> u64 { 10 }
fn default_provider_timeout() -> u64 { 120 }
fn default_priority() -> i32 { 100 }
fn default_first_packet_timeout() -> u64 { 60 }
fn default_failure_threshold() -> u32 { 2 }
fn default_open_duration() -> u64 { 30 }
fn default_rerank_model() -> String { "rerank-v1".to_string() }
fn default_rerank_timeout() -> u64 { 15 }
fn default_tree_path() -> String { "config/intent_tree.json".to_string() }
fn default_intent_min_score() -> f32 { 0.35 }
fn default_max_intent_count() -> usize { 3 }
fn default_max_sub_questions() -> usize { 3 }
fn default_history_messages() -> usize { 6 }
fn default_ambiguity_ratio() -> f32 { 0.8 }
fn default_max_options() -> usize { 6 }
fn default_guidance_ttl() -> u64 { 1800 }
fn default_final_top_k() -> usize { 5 }
fn default_search_multiplier() -> usize { 3 }
fn default_min_search_top_k() -> usize { 20 }
fn default_rerank_multiplier() -> usize { 1 }
fn default_memory_max_messages() -> usize { 20 }
fn default_mcp_timeout() -> u64 { 20 }
fn default_classify_workers() -> usize { 8 }
fn default_context_workers() -> usize { 8 }
fn default_kb_workers() -> usize { 16 }
fn default_stream_workers() -> usize { 64 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "askforge".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// First-packet deadline for streaming candidates
    pub fn first_packet_timeout(&self) -> Duration {
        Duration::from_secs(self.ai.chat.first_packet_timeout_secs)
    }
}

impl DatabaseConfig {
    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.read_url.as_deref().unwrap_or(&self.url)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            user_header: default_user_header(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for ChatModelsConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            first_packet_timeout_secs: default_first_packet_timeout(),
        }
    }
}

impl Default for HealthPolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration(),
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: default_rerank_model(),
            timeout_secs: default_rerank_timeout(),
        }
    }
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            tree_path: default_tree_path(),
            min_score: default_intent_min_score(),
            max_intent_count: default_max_intent_count(),
        }
    }
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_sub_questions: default_max_sub_questions(),
            history_messages: default_history_messages(),
        }
    }
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_score: default_intent_min_score(),
            ambiguity_ratio: default_ambiguity_ratio(),
            max_options: default_max_options(),
            state_ttl_secs: default_guidance_ttl(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_top_k: default_final_top_k(),
            search_multiplier: default_search_multiplier(),
            min_search_top_k: default_min_search_top_k(),
            rerank_multiplier: default_rerank_multiplier(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_memory_max_messages(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_mcp_timeout(),
            tools: Vec::new(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            classify_workers: default_classify_workers(),
            context_workers: default_context_workers(),
            kb_workers: default_kb_workers(),
            stream_workers: default_stream_workers(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}
