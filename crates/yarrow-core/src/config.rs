//! Environment-backed configuration.
//!
//! Numeric fields arrive as strings (`YARROW_CONTEXT_WINDOW`,
//! `YARROW_EMBEDDING_DIM`, `YARROW_EMBEDDING_CHUNK_SIZE`) and are coerced
//! on load. A model-keyed fallback table supplies the context window when
//! it is not configured explicitly.

use anyhow::{Context, Result};

/// Fallback context windows per model, used when `context_window` is
/// absent from the environment.
pub fn default_context_window(model: &str) -> usize {
    match model {
        "gpt-4" => 8_192,
        "gpt-4-32k" => 32_768,
        "gpt-4-turbo" | "gpt-4o" => 128_000,
        "gpt-3.5-turbo" => 4_096,
        "gpt-3.5-turbo-16k" => 16_384,
        "llama3-8b-8192" => 8_192,
        _ => 8_192,
    }
}

/// Completion endpoint configuration (one per agent, immutable).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub model_endpoint: String,
    pub api_key: Option<String>,
    pub context_window: usize,
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    pub fn new(model: impl Into<String>, model_endpoint: impl Into<String>) -> Self {
        let model = model.into();
        let context_window = default_context_window(&model);
        Self {
            model,
            model_endpoint: model_endpoint.into(),
            api_key: None,
            context_window,
            request_timeout_secs: 120,
        }
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }
}

/// Embedding endpoint configuration (one per agent, immutable).
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub embedding_endpoint: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub embedding_chunk_size: usize,
    pub api_key: Option<String>,
}

impl EmbeddingConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            embedding_endpoint: endpoint.into(),
            embedding_model: model.into(),
            embedding_dim: dim,
            embedding_chunk_size: 300,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub api_token: Option<String>,
    pub preset: String,
    pub persona: String,
    pub human: String,
    pub chaining: bool,
    pub max_chaining_steps: Option<usize>,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
}

/// Default persona text for fresh agents.
pub const DEFAULT_PERSONA: &str = "I am Yarrow, a thoughtful digital companion. I maintain long-term memory across our conversations, keep track of what matters to the people I talk to, and strive to be warm, concise, and genuinely helpful.";

/// Default human block for fresh agents (empty until learned).
pub const DEFAULT_HUMAN: &str = "First name: ?";

fn parse_env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<usize>()
                .with_context(|| format!("{key} must be a number (got '{raw}')"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let model =
            std::env::var("YARROW_MODEL").unwrap_or_else(|_| "gpt-4".to_string());
        let model_endpoint = std::env::var("YARROW_MODEL_ENDPOINT")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("YARROW_API_KEY").ok();

        let context_window = parse_env_usize("YARROW_CONTEXT_WINDOW")?
            .unwrap_or_else(|| default_context_window(&model));

        let mut llm = LlmConfig::new(model, model_endpoint).with_context_window(context_window);
        llm.api_key = api_key.clone();

        let embedding_endpoint = std::env::var("YARROW_EMBEDDING_ENDPOINT")
            .unwrap_or_else(|_| llm.model_endpoint.clone());
        let embedding_model = std::env::var("YARROW_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-ada-002".to_string());
        let embedding_dim = parse_env_usize("YARROW_EMBEDDING_DIM")?.unwrap_or(1536);
        let embedding_chunk_size =
            parse_env_usize("YARROW_EMBEDDING_CHUNK_SIZE")?.unwrap_or(300);

        let mut embedding =
            EmbeddingConfig::new(embedding_endpoint, embedding_model, embedding_dim);
        embedding.embedding_chunk_size = embedding_chunk_size;
        embedding.api_key = api_key;

        let max_chaining_steps = parse_env_usize("YARROW_MAX_CHAINING_STEPS")?;

        Ok(Self {
            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8283".to_string())
                .parse()
                .context("HTTP_PORT must be a valid port number")?,
            api_token: std::env::var("YARROW_API_TOKEN").ok(),
            preset: std::env::var("YARROW_PRESET")
                .unwrap_or_else(|_| "yarrow_chat".to_string()),
            persona: std::env::var("YARROW_PERSONA")
                .unwrap_or_else(|_| DEFAULT_PERSONA.to_string()),
            human: std::env::var("YARROW_HUMAN").unwrap_or_else(|_| DEFAULT_HUMAN.to_string()),
            chaining: std::env::var("YARROW_CHAINING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            max_chaining_steps,
            llm,
            embedding,
        })
    }
}
