//! Engine adapters and the runner registry.

pub mod claude;
pub mod codex;
pub mod mock;
pub mod opencode;
pub mod pi;
pub mod tool_title;

use std::sync::Arc;

use crate::config::{Config, ConfigError, EngineTable};
use crate::model::{EngineId, ResumeToken};
use crate::runner::Runner;

pub type BuildFn = fn(&EngineTable) -> Result<Arc<dyn Runner>, ConfigError>;

/// A registerable engine backend: id, constructor, and the install hint shown
/// when the CLI is missing.
pub struct EngineBackend {
    pub id: EngineId,
    pub build: BuildFn,
    pub install_cmd: &'static str,
}

pub fn builtin_backends() -> Vec<EngineBackend> {
    vec![
        EngineBackend {
            id: EngineId::new(codex::ENGINE),
            build: codex::build_runner,
            install_cmd: "npm install -g @openai/codex",
        },
        EngineBackend {
            id: EngineId::new(claude::ENGINE),
            build: claude::build_runner,
            install_cmd: "npm install -g @anthropic-ai/claude-code",
        },
        EngineBackend {
            id: EngineId::new(opencode::ENGINE),
            build: opencode::build_runner,
            install_cmd: "npm install -g opencode-ai@latest",
        },
        EngineBackend {
            id: EngineId::new(pi::ENGINE),
            build: pi::build_runner,
            install_cmd: "npm install -g @mariozechner/pi-coding-agent",
        },
        EngineBackend {
            id: EngineId::new(mock::ENGINE),
            build: mock::build_runner,
            install_cmd: "",
        },
    ]
}

/// Adapter registry in resolution order: configured default engine first,
/// then the remaining backends in registration order.
pub struct RunnerRegistry {
    entries: Vec<Arc<dyn Runner>>,
    default_engine: EngineId,
}

impl RunnerRegistry {
    pub fn build(
        config: &Config,
        default_override: Option<EngineId>,
    ) -> Result<Self, ConfigError> {
        Self::build_from(builtin_backends(), config, default_override)
    }

    pub fn build_from(
        backends: Vec<EngineBackend>,
        config: &Config,
        default_override: Option<EngineId>,
    ) -> Result<Self, ConfigError> {
        let available = || {
            backends
                .iter()
                .map(|b| b.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let default_engine = default_override
            .or_else(|| config.default_engine.as_deref().map(EngineId::from))
            .unwrap_or_else(|| EngineId::new(codex::ENGINE));
        if !backends.iter().any(|b| b.id == default_engine) {
            return Err(ConfigError::UnknownEngine {
                engine: default_engine.as_str().to_string(),
                available: available(),
            });
        }

        // Reject config tables for engines that do not exist.
        for configured in config.engines.keys() {
            if !backends.iter().any(|b| b.id.as_str() == configured) {
                return Err(ConfigError::UnknownEngine {
                    engine: configured.clone(),
                    available: available(),
                });
            }
        }

        let mut entries = Vec::with_capacity(backends.len());
        let (defaults, others): (Vec<_>, Vec<_>) =
            backends.into_iter().partition(|b| b.id == default_engine);
        for backend in defaults.into_iter().chain(others) {
            let table = config.engine_table(&backend.id);
            entries.push((backend.build)(&table)?);
        }

        Ok(Self {
            entries,
            default_engine,
        })
    }

    pub fn default_engine(&self) -> &EngineId {
        &self.default_engine
    }

    pub fn default_runner(&self) -> Arc<dyn Runner> {
        Arc::clone(&self.entries[0])
    }

    pub fn get(&self, engine: &EngineId) -> Option<Arc<dyn Runner>> {
        self.entries
            .iter()
            .find(|r| r.engine() == engine)
            .map(Arc::clone)
    }

    pub fn engine_ids(&self) -> Vec<EngineId> {
        self.entries.iter().map(|r| r.engine().clone()).collect()
    }

    /// Walk adapters in registry order and extract the last resume line from
    /// `text`; the first adapter with a match wins.
    pub fn resolve_resume(&self, text: &str) -> Option<(Arc<dyn Runner>, ResumeToken)> {
        for runner in &self.entries {
            if let Some(token) = runner.extract_resume(text) {
                return Some((Arc::clone(runner), token));
            }
        }
        None
    }
}
