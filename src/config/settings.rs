//! Engine settings loaded from a TOML file
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! runnable configuration:
//!
//! ```toml
//! [llm]
//! provider = "ollama"
//! model = "llama3.2"
//!
//! [rate_limit]
//! window_secs = 60
//! max_calls = 30
//!
//! [memory]
//! backend = "sqlite"
//! top_k = 10
//!
//! [persona]
//! name = "cheerful"
//! user_name = "Alex"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Root settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmSettings,

    /// Provider call budget
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Backoff for transient provider failures
    #[serde(default)]
    pub retry: RetrySettings,

    /// Long-term memory backend
    #[serde(default)]
    pub memory: MemorySettings,

    /// Prompt assembly budgets
    #[serde(default)]
    pub context: ContextSettings,

    /// Per-stage timeouts and retry counts
    #[serde(default)]
    pub engine: EngineSettings,

    /// Which persona to load and who is talking to it
    #[serde(default)]
    pub persona: PersonaSettings,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load settings from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Apply environment-style overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = lookup("LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(backend) = lookup("MEMORY_BACKEND") {
            self.memory.backend = backend.parse()?;
        }
        if let Some(url) = lookup("MEM0_URL") {
            self.memory.mem0_url = url;
        }
        if let Some(url) = lookup("MEMORY_RERANK_URL") {
            self.memory.rerank_url = Some(url);
        }
        if let Some(name) = lookup("PACE_PERSONA") {
            self.persona.name = name;
        }
        if let Some(user) = lookup("PACE_USER_NAME") {
            self.persona.user_name = user;
        }
        if let Some(dir) = lookup("PACE_PERSONAS_DIR") {
            self.persona.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Reject values that would stall or disable the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 15] = [
            (self.retry.max_attempts == 0, "retry.max_attempts must be at least 1"),
            (self.rate_limit.window_secs == 0, "rate_limit.window_secs must be positive"),
            (self.rate_limit.max_calls == 0, "rate_limit.max_calls must be at least 1"),
            (self.rate_limit.max_tokens == 0, "rate_limit.max_tokens must be positive"),
            (self.memory.top_k == 0, "memory.top_k must be at least 1"),
            (self.context.prompt_token_budget == 0, "context.prompt_token_budget must be positive"),
            (self.memory.max_write_attempts == 0, "memory.max_write_attempts must be at least 1"),
            (self.engine.generate_attempts == 0, "engine.generate_attempts must be at least 1"),
            (self.engine.recall_timeout_secs == 0, "engine.recall_timeout_secs must be positive"),
            (self.engine.generate_timeout_secs == 0, "engine.generate_timeout_secs must be positive"),
            (self.engine.persist_timeout_secs == 0, "engine.persist_timeout_secs must be positive"),
            (
                self.rate_limit.max_tokens < u64::from(self.llm.max_tokens),
                "rate_limit.max_tokens must be at least llm.max_tokens",
            ),
            (self.llm.max_tokens == 0, "llm.max_tokens must be positive"),
            (self.llm.model.trim().is_empty(), "llm.model must not be empty"),
            (self.persona.user_name.trim().is_empty(), "persona.user_name must not be empty"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Validation(message.to_string())),
            None => Ok(()),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Provider name: "ollama", "openai", "groq", "local"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Custom API endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key environment variable name (for cloud providers)
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Sent as `OpenAI-Organization` by the openai provider
    #[serde(default)]
    pub organization: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens the model may generate per reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// HTTP timeout for a single provider request
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: None,
            organization: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Fixed-window call budget per provider/model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub max_calls: u32,
    pub max_tokens: u64,
    /// Longest a caller may wait for the window to roll over
    pub max_wait_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_calls: 30,
            max_tokens: 1_000_000,
            max_wait_secs: 30,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Exponential backoff for transient provider errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Memory backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackendKind {
    Sqlite,
    Mem0,
    Disabled,
}

impl FromStr for MemoryBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(MemoryBackendKind::Sqlite),
            "mem0" => Ok(MemoryBackendKind::Mem0),
            "disabled" | "none" | "off" => Ok(MemoryBackendKind::Disabled),
            other => Err(ConfigError::Validation(format!("unknown memory backend '{}'", other))),
        }
    }
}

/// Long-term memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub backend: MemoryBackendKind,

    /// Records recalled per turn
    pub top_k: usize,

    /// SQLite database file; defaults to `{data_dir}/memory.db`
    pub sqlite_path: Option<PathBuf>,

    pub mem0_url: String,

    /// Environment variable holding the mem0 API key
    pub mem0_api_key_env: Option<String>,

    /// Ask mem0 to rerank search results server-side
    pub mem0_rerank: bool,

    /// Scoring service used to rerank recalled memories; unset disables it
    pub rerank_url: Option<String>,

    /// Queue failed writes and retry them on the next turn
    pub persist_retry: bool,

    pub max_pending_batches: usize,

    /// Write attempts for one batch before it is dropped
    pub max_write_attempts: u32,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            backend: MemoryBackendKind::Sqlite,
            top_k: 10,
            sqlite_path: None,
            mem0_url: "http://localhost:8888".to_string(),
            mem0_api_key_env: None,
            mem0_rerank: false,
            rerank_url: None,
            persist_retry: true,
            max_pending_batches: 16,
            max_write_attempts: 3,
        }
    }
}

/// Prompt budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Estimated tokens allowed for the whole prompt
    pub prompt_token_budget: usize,
    /// Estimated tokens of history offered to the assembler
    pub history_token_budget: usize,
    /// Most recent turns offered to the assembler
    pub max_history_turns: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            prompt_token_budget: 32_768,
            history_token_budget: 32_768,
            max_history_turns: 40,
        }
    }
}

/// Stage timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub recall_timeout_secs: u64,
    pub generate_timeout_secs: u64,
    pub persist_timeout_secs: u64,
    /// In-place GENERATE attempts when the stage times out
    pub generate_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recall_timeout_secs: 10,
            generate_timeout_secs: 180,
            persist_timeout_secs: 15,
            generate_attempts: 2,
        }
    }
}

/// Persona selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSettings {
    /// Persona file stem under `dir`, or a built-in name
    pub name: String,
    pub user_name: String,
    pub dir: PathBuf,
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            name: "cheerful".to_string(),
            user_name: "user".to_string(),
            dir: PathBuf::from("personas"),
        }
    }
}
