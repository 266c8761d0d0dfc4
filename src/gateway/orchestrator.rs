//! HTTP surface. Wires the Agent Registry, Run Manager, and Session Store
//! together behind the Run API routes and builds the sync/streaming
//! response bodies for `POST /runs`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::gateway::agent_connection::AgentConnection;
use crate::gateway::auth::require_authorization;
use crate::gateway::config::Settings;
use crate::gateway::error::{AgentProcessError, GatewayError};
use crate::gateway::models::{
    AgentSummary, Message, MessagePart, Run, RunCreateRequest, RunMode, RunStatus,
};
use crate::gateway::registry::AgentRegistry;
use crate::gateway::run_manager::RunManager;
use crate::gateway::session_store::SessionStore;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<AgentRegistry>,
    pub run_manager: Arc<RunManager>,
    pub session_store: Arc<SessionStore>,
    pub settings: Arc<Settings>,
}

pub fn build_router(state: GatewayState) -> Router {
    let settings = state.settings.clone();
    Router::new()
        .route("/ping", get(ping))
        .route("/agents", get(list_agents))
        .route("/agents/{name}", get(agent_manifest))
        .route("/runs", post(create_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}", delete(delete_session))
        .route_layer(middleware::from_fn_with_state(settings, require_authorization))
        .with_state(state)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_agents(State(state): State<GatewayState>) -> Json<Vec<AgentSummary>> {
    let agents = state
        .registry
        .list()
        .into_iter()
        .map(|agent| AgentSummary {
            name: agent.name,
            description: agent.description,
        })
        .collect();
    Json(agents)
}

async fn agent_manifest(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    let manifest = state.registry.manifest_for(&name)?;
    Ok(Json(manifest).into_response())
}

fn format_sse(event: &str, data: &serde_json::Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

fn prompt_content_from(message: &Message) -> Vec<MessagePart> {
    message.content.clone()
}

/// Spawns the task that drains chunk text from the agent's streamed
/// output, persists each part through the Run Manager, and — in
/// streaming mode — forwards a `message.part` SSE frame for each one.
fn spawn_chunk_consumer(
    run_manager: Arc<RunManager>,
    run_id: String,
    sse_tx: Option<mpsc::UnboundedSender<Bytes>>,
) -> (mpsc::UnboundedSender<String>, tokio::task::JoinHandle<Vec<String>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        let mut parts = Vec::new();
        while let Some(text) = rx.recv().await {
            if let Err(err) = run_manager.append_output_part(&run_id, &text).await {
                warn!("failed to append output part for run {run_id}: {err}");
            }
            if let Some(tx) = &sse_tx {
                let frame = format_sse(
                    "message.part",
                    &json!({ "run_id": run_id, "delta": { "type": "text", "text": text } }),
                );
                let _ = tx.send(frame);
            }
            parts.push(text);
        }
        parts
    });
    (tx, handle)
}

/// Establishes the agent connection, initializes it, and either loads an
/// existing ZedACP-style session or creates a fresh one, returning the
/// session id to prompt against.
async fn establish_session(
    connection: &AgentConnection,
    state: &GatewayState,
    run_id: &str,
    agent: &crate::gateway::models::AgentConfig,
    payload: &RunCreateRequest,
) -> Result<String, AgentProcessError> {
    connection.initialize(agent.api_key.as_deref()).await?;
    let working_dir = state.settings.agent_working_dir.to_string_lossy().to_string();
    let mcp_servers: Vec<serde_json::Value> = Vec::new();

    let Some(acp_session_id) = payload.session_id.as_deref() else {
        return connection.start_session(&working_dir, &mcp_servers).await;
    };

    let record = state
        .session_store
        .get_or_create(acp_session_id, &payload.agent, &working_dir)
        .await
        .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

    if let Some(zed_session_id) = record.zed_session_id.as_deref() {
        match connection.load_session(zed_session_id, &working_dir, &mcp_servers).await {
            Ok(()) => {
                debug!("run {run_id}: loaded existing session {zed_session_id}");
                return Ok(zed_session_id.to_string());
            }
            Err(err) => {
                warn!("run {run_id}: failed to load session {zed_session_id}, creating new one: {err}");
            }
        }
    }

    let session_id = connection.start_session(&working_dir, &mcp_servers).await?;
    let _ = state
        .session_store
        .update_zed_session_id(acp_session_id, &session_id)
        .await;
    Ok(session_id)
}

async fn persist_history(
    state: &GatewayState,
    session_id_acp: &str,
    run_id: &str,
    input: &Message,
    output: Option<&Message>,
) {
    if let Err(err) = state
        .session_store
        .append_message(session_id_acp, run_id, input, 0)
        .await
    {
        warn!("failed to persist input message for session {session_id_acp}: {err}");
    }
    if let Some(output) = output {
        if let Err(err) = state
            .session_store
            .append_message(session_id_acp, run_id, output, 1)
            .await
        {
            warn!("failed to persist output message for session {session_id_acp}: {err}");
        }
    }
    let _ = state.session_store.update_activity(session_id_acp, run_id).await;
}

async fn create_run(
    State(state): State<GatewayState>,
    Json(payload): Json<RunCreateRequest>,
) -> Result<Response, GatewayError> {
    if payload.input.is_empty() {
        return Err(GatewayError::InvalidRequest("input content must not be empty".to_string()));
    }
    let agent = state.registry.get(&payload.agent)?;
    let run = state.run_manager.create_run(&agent.name, payload.mode).await;

    match payload.mode {
        RunMode::Sync => run_sync(state, agent, run, payload).await,
        RunMode::Stream => Ok(run_stream(state, agent, run, payload)),
    }
}

async fn run_sync(
    state: GatewayState,
    agent: crate::gateway::models::AgentConfig,
    run: Run,
    payload: RunCreateRequest,
) -> Result<Response, GatewayError> {
    let env = agent
        .api_key
        .as_ref()
        .map(|key| vec![("OPENAI_API_KEY".to_string(), key.clone())])
        .unwrap_or_default();

    let connection = match AgentConnection::start(&agent.command, &env, Some(state.settings.agent_working_dir.as_path())).await {
        Ok(connection) => Arc::new(connection),
        Err(err) => {
            let failed = state
                .run_manager
                .fail_run(&run.id, &err.to_string(), "agent_error")
                .await?;
            return Ok((StatusCode::BAD_GATEWAY, Json(failed.error.clone())).into_response());
        }
    };

    let outcome = run_sync_inner(&state, &connection, &run, &agent, &payload).await;
    connection.close().await;

    match outcome {
        Ok(completed) => Ok(Json(completed).into_response()),
        Err(err) => {
            let failed = state
                .run_manager
                .fail_run(&run.id, &err.to_string(), "agent_error")
                .await?;
            warn!("sync run {} failed: {err}", run.id);
            Ok((StatusCode::BAD_GATEWAY, Json(failed.error.clone())).into_response())
        }
    }
}

async fn run_sync_inner(
    state: &GatewayState,
    connection: &Arc<AgentConnection>,
    run: &Run,
    agent: &crate::gateway::models::AgentConfig,
    payload: &RunCreateRequest,
) -> Result<Run, AgentProcessError> {
    state
        .run_manager
        .start_run(&run.id, connection.clone())
        .await
        .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

    let session_id = establish_session(connection, state, &run.id, agent, payload).await?;
    state
        .run_manager
        .set_session_id(&run.id, &session_id)
        .await
        .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

    let mut cancel_rx = state
        .run_manager
        .cancel_event_for(&run.id)
        .await
        .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

    let (chunk_tx, consumer) = spawn_chunk_consumer(state.run_manager.clone(), run.id.clone(), None);
    let on_chunk = move |text: String| {
        let _ = chunk_tx.send(text);
    };

    let content = prompt_content_from(&payload.input);
    let prompt_result = connection.prompt(&session_id, content, &mut cancel_rx, on_chunk).await;
    let message_parts = consumer.await.unwrap_or_default();

    let already_cancelling = state
        .run_manager
        .get_run(&run.id)
        .await
        .map(|r| r.status == RunStatus::Cancelling)
        .unwrap_or(false);

    let outcome = match prompt_result {
        Err(AgentProcessError::Cancelled(_)) => None,
        Err(other) => return Err(other),
        Ok(_outcome) if already_cancelling => {
            debug!("run {} completed right as cancellation landed", run.id);
            None
        }
        Ok(outcome) => Some(outcome),
    };

    let Some(outcome) = outcome else {
        let cancelled = state
            .run_manager
            .cancel_run(&run.id)
            .await
            .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;
        return Ok(cancelled);
    };

    let completed = state
        .run_manager
        .complete_run(&run.id, outcome.stop_reason)
        .await
        .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

    if let Some(acp_session_id) = payload.session_id.as_deref() {
        let output = if message_parts.is_empty() {
            None
        } else {
            Some(Message::assistant_text(message_parts))
        };
        persist_history(state, acp_session_id, &run.id, &payload.input, output.as_ref()).await;
    }

    Ok(completed)
}

fn run_stream(
    state: GatewayState,
    agent: crate::gateway::models::AgentConfig,
    run: Run,
    payload: RunCreateRequest,
) -> Response {
    let (sse_tx, sse_rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        let started_frame = format_sse("run.started", &serde_json::to_value(&run).unwrap_or(json!({})));
        let _ = sse_tx.send(started_frame);
        info!("run.started emitted for run {}", run.id);

        if let Err(err) = run_stream_inner(&state, &agent, &run, &payload, &sse_tx).await {
            let failed = state
                .run_manager
                .fail_run(&run.id, &err.to_string(), "agent_error")
                .await;
            if let Ok(failed) = failed {
                let _ = sse_tx.send(format_sse("run.failed", &serde_json::to_value(&failed).unwrap_or(json!({}))));
            }
        }
        // sse_tx dropped here, closing the stream.
    });

    let stream = UnboundedReceiverStream::new(sse_rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(axum::body::Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn run_stream_inner(
    state: &GatewayState,
    agent: &crate::gateway::models::AgentConfig,
    run: &Run,
    payload: &RunCreateRequest,
    sse_tx: &mpsc::UnboundedSender<Bytes>,
) -> Result<(), AgentProcessError> {
    let env = agent
        .api_key
        .as_ref()
        .map(|key| vec![("OPENAI_API_KEY".to_string(), key.clone())])
        .unwrap_or_default();

    let connection = Arc::new(
        AgentConnection::start(&agent.command, &env, Some(state.settings.agent_working_dir.as_path())).await?,
    );

    let result = async {
        state
            .run_manager
            .start_run(&run.id, connection.clone())
            .await
            .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

        let session_id = establish_session(&connection, state, &run.id, agent, payload).await?;
        state
            .run_manager
            .set_session_id(&run.id, &session_id)
            .await
            .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

        let mut cancel_rx = state
            .run_manager
            .cancel_event_for(&run.id)
            .await
            .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;

        let (chunk_tx, consumer) =
            spawn_chunk_consumer(state.run_manager.clone(), run.id.clone(), Some(sse_tx.clone()));
        let on_chunk = move |text: String| {
            let _ = chunk_tx.send(text);
        };

        let content = prompt_content_from(&payload.input);
        let prompt_result = connection.prompt(&session_id, content, &mut cancel_rx, on_chunk).await;
        let message_parts = consumer.await.unwrap_or_default();

        let already_cancelling = state
            .run_manager
            .get_run(&run.id)
            .await
            .map(|r| r.status == RunStatus::Cancelling)
            .unwrap_or(false);

        let outcome = match prompt_result {
            Err(AgentProcessError::Cancelled(_)) => None,
            Err(other) => return Err(other),
            Ok(_outcome) if already_cancelling => {
                debug!("run {} completed right as cancellation landed", run.id);
                None
            }
            Ok(outcome) => Some(outcome),
        };

        let Some(outcome) = outcome else {
            let cancelled = state
                .run_manager
                .cancel_run(&run.id)
                .await
                .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;
            let _ = sse_tx.send(format_sse("run.cancelled", &serde_json::to_value(&cancelled).unwrap_or(json!({}))));
            return Ok(());
        };

        let completed = state
            .run_manager
            .complete_run(&run.id, outcome.stop_reason)
            .await
            .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;
        let _ = sse_tx.send(format_sse("run.completed", &serde_json::to_value(&completed).unwrap_or(json!({}))));

        if let Some(acp_session_id) = payload.session_id.as_deref() {
            if !message_parts.is_empty() {
                let output = Message::assistant_text(message_parts);
                persist_history(state, acp_session_id, &run.id, &payload.input, Some(&output)).await;
            }
        }
        Ok(())
    }
    .await;

    connection.close().await;
    result
}

async fn cancel_run(
    State(state): State<GatewayState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, GatewayError> {
    // Confirms the run exists before acting, matching the lookup-then-act
    // shape of the original handler (a bare request_cancel would also
    // 404 via RunNotFound, but this keeps the error path explicit).
    state.run_manager.get_run(&run_id).await?;
    let response_run = state.run_manager.request_cancel(&run_id).await?;
    Ok(Json(response_run))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    agent_name: Option<String>,
    #[serde(default = "default_true")]
    active_only: bool,
}

fn default_true() -> bool {
    true
}

async fn list_sessions(
    State(state): State<GatewayState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<serde_json::Value>>, GatewayError> {
    let sessions = state
        .session_store
        .list(query.agent_name.as_deref(), query.active_only)
        .await?;
    let payload = sessions
        .into_iter()
        .map(|session| {
            json!({
                "session_id": session.acp_session_id,
                "agent_name": session.agent_name,
                "zed_session_id": session.zed_session_id,
                "working_directory": session.working_directory,
                "created_at": session.created_at,
                "updated_at": session.updated_at,
                "is_active": session.is_active,
                "last_run_id": session.last_run_id,
            })
        })
        .collect();
    Ok(Json(payload))
}

async fn get_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let session = state
        .session_store
        .get(&session_id)
        .await?
        .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))?;
    let history = state.session_store.get_history(&session_id, None).await?;

    Ok(Json(json!({
        "session_id": session.acp_session_id,
        "agent_name": session.agent_name,
        "zed_session_id": session.zed_session_id,
        "working_directory": session.working_directory,
        "created_at": session.created_at,
        "updated_at": session.updated_at,
        "is_active": session.is_active,
        "last_run_id": session.last_run_id,
        "message_count": history.len(),
        "history": history.iter().map(|entry| json!({
            "run_id": entry.run_id,
            "role": entry.message.role,
            "created_at": entry.created_at,
            "sequence_number": entry.sequence_number,
        })).collect::<Vec<_>>(),
    })))
}

async fn delete_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let deleted = state.session_store.delete(&session_id).await?;
    if !deleted {
        return Err(GatewayError::SessionNotFound(session_id));
    }
    Ok(Json(json!({ "deleted": session_id })))
}
