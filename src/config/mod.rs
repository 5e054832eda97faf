//! Configuration management for SmartChat
//!
//! Loaded from TOML, overridden by profiles and `SMARTCHAT_SECTION__KEY`
//! environment variables, then validated as a whole.

use crate::error::{Result, SmartChatError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub server: ServerConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub context: ContextConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Socket server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub max_connections: usize,
    /// Capacity of the per-query event queue
    pub stream_buffer: usize,
    /// How long a connection may take to send its request frame
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
    /// How long shutdown waits for open connections before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

fn default_request_timeout() -> String {
    "10s".to_string()
}

fn default_shutdown_grace() -> String {
    "5s".to_string()
}

/// Hybrid retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k_initial: usize,
    pub final_k: usize,
    /// Weight of the normalized vector score; keyword gets `1 - alpha`
    pub alpha: f32,
    /// "weighted" or "rrf"
    pub fusion_method: String,
    pub rrf_k: f32,
    /// Candidates with a lower fused score are dropped
    pub min_fused_score: f32,
    /// Score floor passed to the vector collaborator
    pub min_vector_score: f32,
    /// Bounded wait for each retrieval source
    pub source_timeout: String,
}

/// Second-pass relevance scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub enabled: bool,
    /// "cross_encoder" or "term_overlap"
    pub scorer: String,
    pub model: String,
    pub timeout: String,
}

/// Prompt assembly budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub token_budget: usize,
    pub history_budget: usize,
    pub max_history_turns: usize,
}

/// Query embedding model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub timeout: String,
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub request_timeout: String,
    /// Coalesce streamed deltas up to this many chars (0 forwards each delta)
    pub stream_batch_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Wire protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

/// One configured generation provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    /// Lower runs first
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Cache layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub retrieval_ttl: String,
    pub response_ttl: String,
    pub metadata_ttl: String,
    pub op_timeout: String,
    pub max_entries: usize,
}

/// Local fragment corpus served by the in-memory collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_enabled: Option<bool>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SmartChatError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| SmartChatError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| SmartChatError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| SmartChatError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(alpha) = overrides.alpha {
            self.retrieval.alpha = alpha;
        }
        if let Some(enabled) = overrides.rerank_enabled {
            self.rerank.enabled = enabled;
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = enabled;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: SMARTCHAT_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("SMARTCHAT_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "SERVER__SOCKET_PATH" => {
                self.server.socket_path = PathBuf::from(value);
            }
            "RETRIEVAL__ALPHA" => {
                self.retrieval.alpha = parse_env(path, value)?;
            }
            "RETRIEVAL__TOP_K_INITIAL" => {
                self.retrieval.top_k_initial = parse_env(path, value)?;
            }
            "RETRIEVAL__FINAL_K" => {
                self.retrieval.final_k = parse_env(path, value)?;
            }
            "RERANK__ENABLED" => {
                self.rerank.enabled = parse_env(path, value)?;
            }
            "CACHE__ENABLED" => {
                self.cache.enabled = parse_env(path, value)?;
            }
            "CORPUS__PATH" => {
                self.corpus.path = Some(PathBuf::from(value));
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SmartChatError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("smartchat").join("config.toml"))
    }

    /// Providers that are switched on, in priority order
    pub fn enabled_providers(&self) -> Vec<&ProviderConfig> {
        let mut providers: Vec<&ProviderConfig> =
            self.llm.providers.iter().filter(|p| p.enabled).collect();
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        providers
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| SmartChatError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Parse duration strings like "800ms", "2s", "15m", "24h" (bare numbers are seconds)
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();

    // "ms" before "s" because "ms" ends with "s"
    if let Some(ms) = value.strip_suffix("ms") {
        ms.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = value.strip_suffix('s') {
        secs.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(mins) = value.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = value.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        value.parse().ok().map(Duration::from_secs)
    }
}

/// Parse a duration that already passed validation, falling back to `default`
pub fn duration_or(value: &str, default: Duration) -> Duration {
    parse_duration(value).unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("~/.smartchat");

        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            server: ServerConfig {
                socket_path: data_dir.join("smartchat.sock"),
                max_connections: 64,
                stream_buffer: 64,
                request_timeout: default_request_timeout(),
                shutdown_grace: default_shutdown_grace(),
            },
            retrieval: RetrievalConfig {
                top_k_initial: 30,
                final_k: 10,
                alpha: 0.7,
                fusion_method: "weighted".to_string(),
                rrf_k: 60.0,
                min_fused_score: 0.05,
                min_vector_score: 0.1,
                source_timeout: "2s".to_string(),
            },
            rerank: RerankConfig {
                enabled: true,
                scorer: "cross_encoder".to_string(),
                model: "BAAI/bge-reranker-base".to_string(),
                timeout: "3s".to_string(),
            },
            context: ContextConfig {
                token_budget: 3000,
                history_budget: 600,
                max_history_turns: 5,
            },
            embedding: EmbeddingConfig {
                model: "all-MiniLM-L6-v2".to_string(),
                timeout: "2s".to_string(),
            },
            llm: LlmConfig {
                request_timeout: "60s".to_string(),
                stream_batch_chars: 0,
                max_tokens: 1500,
                temperature: 0.7,
                providers: vec![
                    ProviderConfig {
                        name: "openai".to_string(),
                        kind: ProviderKind::OpenAi,
                        model: "gpt-4o".to_string(),
                        base_url: "https://api.openai.com/v1".to_string(),
                        api_key_env: "OPENAI_API_KEY".to_string(),
                        priority: 0,
                        enabled: true,
                    },
                    ProviderConfig {
                        name: "claude".to_string(),
                        kind: ProviderKind::Anthropic,
                        model: "claude-3-5-sonnet-20241022".to_string(),
                        base_url: "https://api.anthropic.com/v1".to_string(),
                        api_key_env: "ANTHROPIC_API_KEY".to_string(),
                        priority: 1,
                        enabled: true,
                    },
                    ProviderConfig {
                        name: "gemini".to_string(),
                        kind: ProviderKind::Gemini,
                        model: "gemini-2.0-flash-exp".to_string(),
                        base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                        api_key_env: "GOOGLE_API_KEY".to_string(),
                        priority: 2,
                        enabled: true,
                    },
                ],
            },
            cache: CacheConfig {
                enabled: true,
                retrieval_ttl: "15m".to_string(),
                response_ttl: "24h".to_string(),
                metadata_ttl: "1h".to_string(),
                op_timeout: "250ms".to_string(),
                max_entries: 10_000,
            },
            corpus: CorpusConfig::default(),
            profiles: HashMap::new(),
        }
    }
}
