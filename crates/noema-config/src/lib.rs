use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NOEMA_DIR_NAME: &str = ".noema";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const DEFAULT_AUTO_LINK_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SUGGEST_THRESHOLD: f64 = 0.6;
pub const DEFAULT_SUGGESTION_LIMIT: u32 = 3;
pub const DEFAULT_INDEX_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_EMBEDDING_DIM: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NoemaConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

/// Acceptance thresholds for the identity-resolution cascade. The
/// auto-link threshold gates silent selection on authoring paths; the
/// suggest threshold gates lookups, below which ranked candidates are
/// surfaced as suggestions instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_auto_link_threshold")]
    pub auto_link_threshold: f64,
    #[serde(default = "default_suggest_threshold")]
    pub suggest_threshold: f64,
    #[serde(default = "default_suggestion_limit")]
    pub suggestion_limit: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_link_threshold: DEFAULT_AUTO_LINK_THRESHOLD,
            suggest_threshold: DEFAULT_SUGGEST_THRESHOLD,
            suggestion_limit: DEFAULT_SUGGESTION_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Upper bound on a single similarity-index round-trip.
    #[serde(default = "default_index_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_INDEX_TIMEOUT_MS,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn noema_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(NOEMA_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    noema_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<NoemaConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(NoemaConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: NoemaConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<NoemaConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(noema_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = NoemaConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

fn default_auto_link_threshold() -> f64 {
    DEFAULT_AUTO_LINK_THRESHOLD
}

fn default_suggest_threshold() -> f64 {
    DEFAULT_SUGGEST_THRESHOLD
}

fn default_suggestion_limit() -> u32 {
    DEFAULT_SUGGESTION_LIMIT
}

fn default_index_timeout_ms() -> u64 {
    DEFAULT_INDEX_TIMEOUT_MS
}

fn default_embedding_dim() -> usize {
    DEFAULT_EMBEDDING_DIM
}

fn normalize_threshold(value: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn normalize_config(mut config: NoemaConfig) -> NoemaConfig {
    config.resolver.auto_link_threshold = normalize_threshold(
        config.resolver.auto_link_threshold,
        DEFAULT_AUTO_LINK_THRESHOLD,
    );
    config.resolver.suggest_threshold =
        normalize_threshold(config.resolver.suggest_threshold, DEFAULT_SUGGEST_THRESHOLD);
    config.resolver.suggestion_limit = config.resolver.suggestion_limit.clamp(1, 20);
    config.index.timeout_ms = config.index.timeout_ms.max(1);
    config.index.embedding_dim = config.index.embedding_dim.clamp(16, 4096);
    config
}
