use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use acp_gateway::gateway::config::Settings;
use acp_gateway::gateway::observability;
use acp_gateway::{build_router, AgentRegistry, GatewayState, RunManager, SessionStore};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Settings::from_env();
    observability::init_logging(&settings);

    let registry = match AgentRegistry::load(&settings.agents_config_path) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!("failed to load agent configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let session_store = match SessionStore::connect(&settings.database_path).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("failed to open session store: {err}");
            return ExitCode::FAILURE;
        }
    };

    let state = GatewayState {
        registry,
        run_manager: Arc::new(RunManager::new()),
        session_store,
        settings: Arc::new(settings.clone()),
    };

    let app = build_router(state);
    let listener = match tokio::net::TcpListener::bind(&settings.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", settings.bind_addr);
            return ExitCode::FAILURE;
        }
    };

    info!("acp-gateway listening on {}", settings.bind_addr);
    if let Err(err) = axum::serve(listener, app).await {
        error!("server error: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
