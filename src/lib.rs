pub mod gateway;

pub use gateway::{
    build_router, AgentConfig, AgentManifest, AgentProcessError, AgentRegistry, GatewayError,
    GatewayState, Message, Run, RunManager, RunMode, RunStatus, SessionStore, Settings,
};
