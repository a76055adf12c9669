//! `conductor.toml` loading.
//!
//! The file has three optional sections: an `[engine]` table of timing
//! parameters, `[[agents]]` to register at startup, and `[[goals]]` to
//! create and decompose at startup.

use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::{AgentSpec, EngineConfig, GoalSpec};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Parsed `conductor.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ConductorConfig {
    /// Loop periods and retry timing.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    /// Goals created and decomposed at startup.
    #[serde(default)]
    pub goals: Vec<GoalSpec>,
}

impl ConductorConfig {
    /// Parse and validate a config document.
    pub fn parse(raw: &str) -> ConductorResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load from disk. A missing file yields the defaults with no seed data.
    pub async fn load(path: &Path) -> ConductorResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
