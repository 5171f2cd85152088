//! Configuration system for ragline.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/ragline/config.toml` and/or `.ragline/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::rag::chunk::ChunkingStrategy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaglineConfig {
    pub llm: LlmConfig,
    /// Optional separate model used as the relevancy judge. Falls back to `llm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<LlmConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl RaglineConfig {
    /// The configuration used for judge calls.
    pub fn judge_llm(&self) -> &LlmConfig {
        self.judge.as_ref().unwrap_or(&self.llm)
    }
}

/// Configuration for a chat-completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai", "anthropic", "ollama" or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o-mini", "claude-sonnet-4-20250514").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Explicit API key. Prefer `api_key_env`; this exists for tests and overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Default temperature for generation.
    pub temperature: f32,
    /// Context window size for the model.
    pub context_window: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 2048,
            temperature: 0.7,
            context_window: 128_000,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    ///
    /// Returns an empty Vec if the config is valid. Problems are reported as
    /// human-readable warnings rather than errors.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_tokens >= self.context_window {
            warnings.push(format!(
                "max_tokens ({}) >= context_window ({}); responses may be truncated or fail",
                self.max_tokens, self.context_window
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            warnings.push(format!(
                "temperature ({}) is outside the usual 0.0-2.0 range",
                self.temperature
            ));
        }
        if self.model.trim().is_empty() {
            warnings.push("model is empty".to_string());
        }
        if self.timeout_secs == 0 {
            warnings.push("timeout_secs is 0; every request will time out".to_string());
        }
        warnings
    }
}

/// Exponential backoff policy for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 32_000,
            jitter: true,
        }
    }
}

/// Retrieval settings: how many fragments, how relevant, and how to embed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Fragments scoring below this are treated as "no evidence".
    pub min_score: f32,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingStrategy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            min_score: 0.1,
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingStrategy::default(),
        }
    }
}

/// Configuration for embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default) or "openai".
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub dimensions: usize,
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            model: None,
            dimensions: 384,
            api_key_env: "OPENAI_API_KEY".into(),
            base_url: None,
        }
    }
}

/// What the pipeline does when retrieval finds nothing relevant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyContextPolicy {
    /// Answer with a fixed refusal without calling the model.
    #[default]
    Refuse,
    /// Send the grounded prompt anyway and rely on the model to refuse.
    AskModel,
}

/// Settings for the RAG pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Instruction placed ahead of the grounding rules in the system message.
    pub system_instruction: String,
    #[serde(default)]
    pub empty_context_policy: EmptyContextPolicy,
    /// Character budget for fragment text inside the prompt.
    pub max_context_chars: usize,
    /// Sampling temperature for answers; `None` uses `llm.temperature`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// How many times an unparseable judge reply is re-asked.
    pub judge_attempts: u32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            system_instruction: "You are a helpful assistant that answers questions about the \
                                 documents in its knowledge base."
                .to_string(),
            empty_context_policy: EmptyContextPolicy::Refuse,
            max_context_chars: 12_000,
            temperature: None,
            judge_attempts: 2,
        }
    }
}

/// Settings for the general chat client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_system: Option<String>,
    /// Messages kept per conversation.
    pub memory_window: usize,
    /// Upper bound on model/tool round trips for one prompt.
    pub max_tool_rounds: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_system: None,
            memory_window: 20,
            max_tool_rounds: 5,
        }
    }
}

/// External MCP servers whose tools are offered to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// A single MCP server launched as a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RAGLINE_`)
/// 3. Workspace-local config (`.ragline/config.toml`)
/// 4. User config (`~/.config/ragline/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RaglineConfig>,
) -> Result<RaglineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RaglineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "ragline", "ragline") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".ragline").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // RAGLINE_LLM__MODEL, RAGLINE_RETRIEVAL__TOP_K, etc.
    figment = figment.merge(Env::prefixed("RAGLINE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "ragline", "ragline")
        && config_dir.config_dir().join("config.toml").exists()
    {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(".ragline").join("config.toml").exists())
}
