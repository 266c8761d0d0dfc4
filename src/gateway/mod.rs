//! The gateway: subprocess Agent-RPC connections fronted by a run-oriented
//! HTTP/SSE API.

pub mod agent_connection;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod run_manager;
pub mod session_store;

pub use config::Settings;
pub use error::{AgentProcessError, GatewayError};
pub use models::{AgentConfig, AgentManifest, Message, Run, RunMode, RunStatus};
pub use orchestrator::{build_router, GatewayState};
pub use registry::AgentRegistry;
pub use run_manager::RunManager;
pub use session_store::SessionStore;
