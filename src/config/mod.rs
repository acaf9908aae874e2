//! Application configuration
//!
//! Process-level values come from the environment (with `.env` support in
//! `main`); engine tuning lives in an optional TOML settings file named by
//! `PACE_CONFIG`. Everything is read once at startup.

pub mod persona;
pub mod settings;

use std::env;
use std::path::PathBuf;

pub use persona::{builtin as persona_builtin, PersonaError, PersonaLibrary, PersonaProfile, StyleRules};
pub use settings::{
    ContextSettings, EngineSettings, LlmSettings, MemoryBackendKind, MemorySettings, PersonaSettings,
    RateLimitSettings, RetrySettings, Settings,
};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Verbose logging
    pub debug: bool,
    /// Root for the chat log and the local memory database
    pub data_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub ollama_url: Option<String>,
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            debug: false,
            data_dir: PathBuf::from("./data"),
            openai_api_key: None,
            groq_api_key: None,
            ollama_url: None,
            settings: Settings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = match env::var("PACE_CONFIG") {
            Ok(path) => Settings::from_file(&PathBuf::from(path))?,
            Err(_) => Settings::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;

        Ok(Self {
            host: env::var("PACE_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PACE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            debug: env::var("PACE_DEBUG").map(|v| is_truthy(&v)).unwrap_or(false),
            data_dir: env::var("PACE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            groq_api_key: env::var("GROQ_API_KEY").ok(),
            ollama_url: env::var("OLLAMA_URL").ok(),
            settings,
        })
    }

    /// Resolve the API key for a provider
    ///
    /// `llm.api_key_env` names the variable when set; otherwise the
    /// provider's conventional variable is used.
    pub fn api_key_for(&self, llm: &LlmSettings, default_env: &str) -> Option<String> {
        let var = llm.api_key_env.as_deref().unwrap_or(default_env);
        match var {
            "OPENAI_API_KEY" => self.openai_api_key.clone(),
            "GROQ_API_KEY" => self.groq_api_key.clone(),
            other => env::var(other).ok(),
        }
        .filter(|key| !key.trim().is_empty())
    }

    /// SQLite database used by the local memory backend
    pub fn memory_db_path(&self) -> PathBuf {
        self.settings
            .memory
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("memory.db"))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
