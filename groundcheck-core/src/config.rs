//! Configuration system for Groundcheck.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> CLI overrides. The user config lives at
//! `~/.config/groundcheck/config.toml` (platform equivalent via `directories`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundcheckConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl GroundcheckConfig {
    /// Validate every section and return prefixed warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.llm.validate() {
            warnings.push(format!("[llm] {}", w));
        }
        for w in self.retriever.validate() {
            warnings.push(format!("[retriever] {}", w));
        }
        for w in self.pipeline.validate() {
            warnings.push(format!("[pipeline] {}", w));
        }
        for w in self.server.validate() {
            warnings.push(format!("[server] {}", w));
        }
        warnings
    }
}

/// Exponential backoff policy for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "backoff_multiplier ({}) is below 1.0; delays will shrink between attempts",
                self.backoff_multiplier
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            warnings.push(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            ));
        }
        if self.max_retries > 10 {
            warnings.push(format!(
                "max_retries is {}; a failing upstream will hold requests for a long time",
                self.max_retries
            ));
        }
        warnings
    }
}

/// Language-model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name. Only OpenAI-compatible endpoints are supported
    /// ("openai", "azure", "ollama", "vllm", "local").
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// API key given directly. Takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Per-attempt HTTP timeout.
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    ///
    /// Returns an empty Vec if the config is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.model.trim().is_empty() {
            warnings.push("model is empty".to_string());
        }
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "temperature ({}) is outside the typical range 0.0 to 2.0",
                self.temperature
            ));
        }
        if self.temperature > 0.0 {
            warnings.push(format!(
                "temperature is {}; scores will vary between identical requests",
                self.temperature
            ));
        }
        if self.timeout_secs == 0 {
            warnings.push("timeout_secs is 0; every model call will time out".to_string());
        }
        if let Some(max_tokens) = self.max_tokens
            && max_tokens < 256
        {
            warnings.push(format!(
                "max_tokens ({}) is small; long answers may be truncated into invalid JSON",
                max_tokens
            ));
        }
        for w in self.retry.validate() {
            warnings.push(format!("retry: {}", w));
        }
        warnings
    }
}

/// Which knowledge retriever backs Stage 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverKind {
    /// Remote retrieval service over HTTP.
    #[default]
    Http,
    /// In-memory knowledge bases loaded from `kb_file`.
    Static,
}

impl std::fmt::Display for RetrieverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrieverKind::Http => write!(f, "http"),
            RetrieverKind::Static => write!(f, "static"),
        }
    }
}

/// Knowledge retriever configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    pub kind: RetrieverKind,
    pub base_url: String,
    pub timeout_secs: u64,
    /// TOML or JSON knowledge-base file for the static retriever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_file: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            kind: RetrieverKind::Http,
            base_url: "http://localhost:8002".to_string(),
            timeout_secs: 30,
            kb_file: None,
            retry: RetryConfig::default(),
        }
    }
}

impl RetrieverConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.kind {
            RetrieverKind::Http => {
                if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://")
                {
                    warnings.push(format!(
                        "base_url ({}) is not an http(s) URL",
                        self.base_url
                    ));
                }
            }
            RetrieverKind::Static => {
                if self.kb_file.is_none() {
                    warnings.push(
                        "kind is static but no kb_file is set; every question will be out of scope"
                            .to_string(),
                    );
                }
            }
        }
        if self.timeout_secs == 0 {
            warnings.push("timeout_secs is 0; every retrieval will time out".to_string());
        }
        for w in self.retry.validate() {
            warnings.push(format!("retry: {}", w));
        }
        warnings
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Passages retrieved per question.
    pub top_k: usize,
    /// Thread pipelines allowed in flight at once.
    pub max_concurrency: usize,
    /// Upper bound on a single model call, retries included.
    pub call_timeout_secs: u64,
    /// Upper bound on a whole analysis request.
    pub request_timeout_secs: u64,
    /// Log full inbound requests and outbound responses at debug level.
    pub debug_payloads: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_concurrency: 4,
            call_timeout_secs: 60,
            request_timeout_secs: 180,
            debug_payloads: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.top_k == 0 {
            warnings.push("top_k is 0; every question will be out of scope".to_string());
        }
        if self.max_concurrency == 0 {
            warnings.push("max_concurrency is 0; it will be treated as 1".to_string());
        }
        if self.request_timeout_secs < self.call_timeout_secs {
            warnings.push(format!(
                "request_timeout_secs ({}) is shorter than call_timeout_secs ({})",
                self.request_timeout_secs, self.call_timeout_secs
            ));
        }
        warnings
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Accepted tokens. Empty means the API is open.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            auth_tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.auth_tokens.is_empty() {
            warnings.push("auth_tokens is empty; the API accepts unauthenticated requests".to_string());
        }
        if self.auth_tokens.iter().any(|t| t.trim().is_empty()) {
            warnings.push("auth_tokens contains a blank token".to_string());
        }
        if self.port == 0 {
            warnings.push("port is 0; the OS will pick an ephemeral port".to_string());
        }
        warnings
    }
}

/// Path of the user-level config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "groundcheck", "groundcheck")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `GROUNDCHECK_`)
/// 3. Explicit config file
/// 4. User config (`~/.config/groundcheck/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&GroundcheckConfig>,
) -> Result<GroundcheckConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(GroundcheckConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // GROUNDCHECK_LLM__MODEL, GROUNDCHECK_PIPELINE__TOP_K, etc.
    figment = figment.merge(Env::prefixed("GROUNDCHECK_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GroundcheckConfig::default();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.temperature, 0.0);
        assert_eq!(config.retriever.kind, RetrieverKind::Http);
        assert_eq!(config.retriever.base_url, "http://localhost:8002");
        assert_eq!(config.pipeline.top_k, 5);
        assert_eq!(config.pipeline.max_concurrency, 4);
        assert_eq!(config.server.port, 8000);
        assert!(config.server.auth_tokens.is_empty());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = GroundcheckConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: GroundcheckConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.llm.model, config.llm.model);
        assert_eq!(deserialized.pipeline.top_k, config.pipeline.top_k);
        assert_eq!(deserialized.retriever.kind, config.retriever.kind);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: GroundcheckConfig = toml::from_str(
            r#"
[pipeline]
top_k = 3
max_concurrency = 8
call_timeout_secs = 30
request_timeout_secs = 90
debug_payloads = true
"#,
        )
        .unwrap();
        assert_eq!(config.pipeline.top_k, 3);
        assert!(config.pipeline.debug_payloads);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.pipeline.request_timeout_secs, 180);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = GroundcheckConfig::default();
        overrides.llm.model = "gpt-4o".to_string();
        overrides.pipeline.max_concurrency = 2;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.pipeline.max_concurrency, 2);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groundcheck.toml");
        std::fs::write(
            &path,
            r#"
[llm]
model = "llama3.1"
base_url = "http://localhost:11434/v1"

[retriever]
kind = "static"
kb_file = "kb.toml"

[server]
auth_tokens = ["secret"]
"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.llm.model, "llama3.1");
        assert_eq!(config.llm.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.retriever.kind, RetrieverKind::Static);
        assert_eq!(config.retriever.kb_file, Some(PathBuf::from("kb.toml")));
        assert_eq!(config.server.auth_tokens, vec!["secret".to_string()]);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/groundcheck.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline]\ntop_k = \"many\"\n").unwrap();
        let err = load_config(Some(&path), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_default_config_only_warns_about_open_auth() {
        let warnings = GroundcheckConfig::default().validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("[server]"));
    }

    #[test]
    fn test_validate_flags_problems() {
        let mut config = GroundcheckConfig::default();
        config.llm.temperature = 0.7;
        config.pipeline.top_k = 0;
        config.pipeline.request_timeout_secs = 10;
        config.retriever.kind = RetrieverKind::Static;
        config.server.auth_tokens = vec!["t".into()];

        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("scores will vary")));
        assert!(warnings.iter().any(|w| w.contains("top_k is 0")));
        assert!(warnings.iter().any(|w| w.contains("shorter than call_timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("no kb_file")));
    }

    #[test]
    fn test_retry_validate() {
        let retry = RetryConfig {
            max_retries: 20,
            initial_backoff_ms: 5000,
            max_backoff_ms: 1000,
            backoff_multiplier: 0.5,
            jitter: false,
        };
        assert_eq!(retry.validate().len(), 3);
        assert!(RetryConfig::default().validate().is_empty());
        assert_eq!(RetryConfig::disabled().max_retries, 0);
    }
}
