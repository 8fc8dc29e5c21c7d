//! Configuration loading for the takopi bridge.
//!
//! A single TOML file holds the default engine, one table of options per
//! engine, the Telegram chat wiring, and the project table used by `/project`
//! and `@branch` directives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::EngineId;

pub const CONFIG_FILE_NAME: &str = "takopi.toml";

/// Raw per-engine option table; each backend validates its own keys.
pub type EngineTable = toml::value::Table;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("missing `telegram.token` in config")]
    MissingTelegramToken,

    #[error("missing `telegram.chat_id` (or `chat_ids`) in config")]
    MissingChatId,

    #[error("unknown engine {engine:?}; available: {available}")]
    UnknownEngine { engine: String, available: String },

    #[error("invalid `{engine}.{key}`; expected {expected}")]
    InvalidEngineOption {
        engine: EngineId,
        key: &'static str,
        expected: &'static str,
    },

    #[error("project {project:?} has no configured path")]
    ProjectWithoutPath { project: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default_engine: Option<String>,
    #[serde(default)]
    pub default_project: Option<String>,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub engines: HashMap<String, EngineTable>,
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub chat_ids: Option<Vec<i64>>,
}

impl TelegramConfig {
    pub fn allowed_chat_ids(&self) -> Vec<i64> {
        if let Some(ids) = &self.chat_ids {
            return ids.clone();
        }
        self.chat_id.into_iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub worktrees_dir: Option<PathBuf>,
    #[serde(default)]
    pub default_engine: Option<String>,
    #[serde(default)]
    pub worktree_base: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    pub fn engine_table(&self, engine: &EngineId) -> EngineTable {
        self.engines
            .get(engine.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Validate the chat wiring; engines are validated by the registry.
    pub fn require_telegram(&self) -> Result<(String, Vec<i64>), ConfigError> {
        let token = self
            .telegram
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingTelegramToken)?;
        let chat_ids = self.telegram.allowed_chat_ids();
        if chat_ids.is_empty() {
            return Err(ConfigError::MissingChatId);
        }
        Ok((token, chat_ids))
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("takopi")
        .join(CONFIG_FILE_NAME)
}

// ── Engine option extraction ──────────────────────────────────────

pub fn opt_str(
    table: &EngineTable,
    engine: &EngineId,
    key: &'static str,
) -> Result<Option<String>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(ConfigError::InvalidEngineOption {
            engine: engine.clone(),
            key,
            expected: "a string",
        }),
    }
}

pub fn opt_bool(
    table: &EngineTable,
    engine: &EngineId,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::Boolean(value)) => Ok(Some(*value)),
        Some(_) => Err(ConfigError::InvalidEngineOption {
            engine: engine.clone(),
            key,
            expected: "a boolean",
        }),
    }
}

pub fn opt_str_list(
    table: &EngineTable,
    engine: &EngineId,
    key: &'static str,
) -> Result<Option<Vec<String>>, ConfigError> {
    let Some(value) = table.get(key) else {
        return Ok(None);
    };
    let err = || ConfigError::InvalidEngineOption {
        engine: engine.clone(),
        key,
        expected: "a list of strings",
    };
    let items = value.as_array().ok_or_else(err)?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_str().ok_or_else(err)?.to_string());
    }
    Ok(Some(out))
}
