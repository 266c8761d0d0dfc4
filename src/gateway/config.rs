//! Process-wide settings sourced from environment variables, read once at
//! startup. Everything has a sensible default except the auth token,
//! which is optional by design (an unset token disables the bearer
//! check — see [`crate::gateway::auth`]).

use std::path::PathBuf;

/// Settings loaded from the environment. Constructed once in `main` and
/// handed around behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub auth_token: Option<String>,
    pub agents_config_path: PathBuf,
    pub database_path: String,
    pub bind_addr: String,
    pub agent_working_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        let auth_token = std::env::var("ACP2_AUTH_TOKEN").ok().filter(|s| !s.is_empty());
        let agents_config_path = std::env::var("ACP2_AGENTS_CONFIG")
            .unwrap_or_else(|_| "config/agents.json".to_string())
            .into();
        let database_path =
            std::env::var("ACP2_DATABASE_PATH").unwrap_or_else(|_| "acp_gateway.sqlite3".to_string());
        let bind_addr = std::env::var("ACP2_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8089".to_string());
        let agent_working_dir = std::env::var("ACP2_AGENT_CWD")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Self {
            auth_token,
            agents_config_path,
            database_path,
            bind_addr,
            agent_working_dir,
        }
    }

    pub fn log_level(&self) -> String {
        std::env::var("ACP2_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible_when_env_is_empty() {
        // Constructing directly rather than through from_env to avoid
        // mutating process-wide environment state from a test.
        let settings = Settings {
            auth_token: None,
            agents_config_path: PathBuf::from("config/agents.json"),
            database_path: "acp_gateway.sqlite3".to_string(),
            bind_addr: "127.0.0.1:8089".to_string(),
            agent_working_dir: PathBuf::from("."),
        };
        assert!(settings.auth_token.is_none());
        assert_eq!(settings.bind_addr, "127.0.0.1:8089");
    }
}
