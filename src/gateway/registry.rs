//! In-memory registry of configured agents, loaded once from a JSON file
//! at startup and reloadable on demand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::debug;

use crate::gateway::error::GatewayError;
use crate::gateway::models::{AgentConfig, AgentManifest, AgentManifestCapabilities, RunMode};

pub struct AgentRegistry {
    config_path: PathBuf,
    agents: RwLock<HashMap<String, AgentConfig>>,
}

impl AgentRegistry {
    /// Loads `config_path` immediately; returns an error if it doesn't
    /// exist or doesn't parse, matching the hard-failure startup behavior
    /// the gateway requires.
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let registry = Self {
            config_path: config_path.as_ref().to_path_buf(),
            agents: RwLock::new(HashMap::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn reload(&self) -> Result<(), GatewayError> {
        debug!("loading agent configuration from {}", self.config_path.display());
        if !self.config_path.exists() {
            return Err(GatewayError::Internal(format!(
                "agents configuration not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)
            .map_err(|err| GatewayError::Internal(format!("failed to read agents config: {err}")))?;
        let parsed: HashMap<String, AgentConfig> = serde_json::from_str(&raw)
            .map_err(|err| GatewayError::Internal(format!("invalid agents config: {err}")))?;
        *self.agents.write().unwrap() = parsed;
        Ok(())
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        self.agents.read().unwrap().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<AgentConfig, GatewayError> {
        self.agents
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::AgentNotFound(name.to_string()))
    }

    pub fn manifest_for(&self, name: &str) -> Result<AgentManifest, GatewayError> {
        let agent = self.get(name)?;
        let description = agent
            .description
            .clone()
            .unwrap_or_else(|| format!("Agent-RPC agent '{}' exposed over the run API.", agent.name));
        let version = agent.version.clone().unwrap_or_else(|| "0.1.0".to_string());
        Ok(AgentManifest {
            name: agent.name,
            description,
            version,
            capabilities: AgentManifestCapabilities {
                modes: vec![RunMode::Sync, RunMode::Stream],
                supports_streaming: true,
                supports_cancellation: true,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn unknown_agent_is_an_error() {
        let file = write_temp_config(r#"{"test": {"name": "test", "command": ["echo"]}}"#);
        let registry = AgentRegistry::load(file.path()).unwrap();
        assert!(registry.get("missing").is_err());
        assert!(registry.get("test").is_ok());
    }

    #[test]
    fn manifest_defaults_description_and_version() {
        let file = write_temp_config(r#"{"test": {"name": "test", "command": ["echo"]}}"#);
        let registry = AgentRegistry::load(file.path()).unwrap();
        let manifest = registry.manifest_for("test").unwrap();
        assert_eq!(manifest.version, "0.1.0");
        assert!(manifest.description.contains("test"));
        assert!(manifest.capabilities.supports_streaming);
    }

    #[test]
    fn missing_config_file_errors() {
        let result = AgentRegistry::load("/nonexistent/agents.json");
        assert!(result.is_err());
    }
}
