//! End-to-end tests against a live instance of the gateway's HTTP
//! surface, driven by the `dummy-agent` fixture binary built alongside
//! the gateway itself.

use std::io::Write;
use std::sync::Arc;

use acp_gateway::gateway::config::Settings;
use acp_gateway::gateway::orchestrator::build_router;
use acp_gateway::gateway::orchestrator::GatewayState;
use acp_gateway::{AgentRegistry, RunManager, SessionStore};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const AUTH_TOKEN: &str = "test-token";

struct TestServer {
    base_url: String,
    _agents_file: tempfile::NamedTempFile,
    _db_file: tempfile::NamedTempFile,
}

async fn spawn_server() -> TestServer {
    let dummy_agent_path = env!("CARGO_BIN_EXE_dummy-agent");

    let mut agents_file = tempfile::NamedTempFile::new().unwrap();
    let config = json!({
        "test": {
            "name": "test",
            "command": [dummy_agent_path],
            "description": "fixture agent"
        }
    });
    agents_file.write_all(config.to_string().as_bytes()).unwrap();

    let db_file = tempfile::NamedTempFile::new().unwrap();

    let settings = Settings {
        auth_token: Some(AUTH_TOKEN.to_string()),
        agents_config_path: agents_file.path().to_path_buf(),
        database_path: db_file.path().to_string_lossy().to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        agent_working_dir: std::env::temp_dir(),
    };

    let registry = Arc::new(AgentRegistry::load(&settings.agents_config_path).unwrap());
    let session_store = Arc::new(SessionStore::connect(&settings.database_path).await.unwrap());
    let state = GatewayState {
        registry,
        run_manager: Arc::new(RunManager::new()),
        session_store,
        settings: Arc::new(settings),
    };

    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        _agents_file: agents_file,
        _db_file: db_file,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn sync_run_against_dummy_agent_completes() {
    let server = spawn_server().await;
    let response = client()
        .post(format!("{}/runs", server.base_url))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "agent": "test",
            "input": { "role": "user", "content": [{ "type": "text", "text": "hello world" }] },
            "mode": "sync"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let run: Value = response.json().await.unwrap();
    assert_eq!(run["status"], "completed");
    let text = run["output"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("hello"));
    assert!(text.contains("world"));
}

#[tokio::test]
async fn stream_run_emits_started_and_completed_events() {
    let server = spawn_server().await;
    let response = client()
        .post(format!("{}/runs", server.base_url))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "agent": "test",
            "input": { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
            "mode": "stream"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("event: run.started"));
    assert!(body.contains("event: run.completed") || body.contains("event: run.cancelled"));
}

#[tokio::test]
async fn unknown_agent_returns_404_without_creating_a_run() {
    let server = spawn_server().await;
    let response = client()
        .post(format!("{}/runs", server.base_url))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "agent": "does-not-exist",
            "input": { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
            "mode": "sync"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn missing_bearer_token_is_rejected() {
    let server = spawn_server().await;
    let response = client().get(format!("{}/ping", server.base_url)).send().await.unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn wrong_bearer_token_is_rejected() {
    let server = spawn_server().await;
    let response = client()
        .get(format!("{}/ping", server.base_url))
        .bearer_auth("not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn correct_bearer_token_is_accepted() {
    let server = spawn_server().await;
    let response = client()
        .get(format!("{}/ping", server.base_url))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

/// Scans `buffer` for a complete `event: <event>\ndata: ...\n\n` frame and
/// parses its data payload as JSON, if one is present.
fn extract_event(buffer: &str, event: &str) -> Option<Value> {
    let marker = format!("event: {event}\n");
    let start = buffer.find(&marker)?;
    let data_start = buffer[start..].find("data: ")? + start + "data: ".len();
    let data_end = buffer[data_start..].find("\n\n")? + data_start;
    serde_json::from_str(&buffer[data_start..data_end]).ok()
}

#[tokio::test]
async fn mid_run_cancellation_is_accepted_and_terminal() {
    use futures_util::StreamExt;

    let server = spawn_server().await;
    let response = client()
        .post(format!("{}/runs", server.base_url))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "agent": "test",
            "input": { "role": "user", "content": [{ "type": "text", "text": "one two three four five six seven eight" }] },
            "mode": "stream"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let run_id = loop {
        let chunk = stream.next().await.unwrap().unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        if let Some(started) = extract_event(&buffer, "run.started") {
            break started["id"].as_str().unwrap().to_string();
        }
    };

    let cancel_response = client()
        .post(format!("{}/runs/{}/cancel", server.base_url, run_id))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(cancel_response.status(), 200);

    let terminal = loop {
        if let Some(event) = extract_event(&buffer, "run.cancelled")
            .or_else(|| extract_event(&buffer, "run.completed"))
        {
            break event;
        }
        let chunk = stream.next().await.unwrap().unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    };
    assert_eq!(terminal["status"], "cancelled");
}

#[tokio::test]
async fn agent_crash_mid_prompt_yields_bad_gateway() {
    // Answers `initialize` and `session/new` normally, then exits without
    // responding to `session/prompt` — exercises the "agent process exits
    // while a request is outstanding" failure path rather than a spawn
    // failure.
    let script = r#"n=0
while read -r line; do
    n=$((n+1))
    if [ "$n" -eq 1 ]; then
        echo '{"jsonrpc":"2.0","id":1,"result":{}}'
    elif [ "$n" -eq 2 ]; then
        echo '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"crash-session"}}'
    else
        exit 1
    fi
done
"#;

    let mut agents_file = tempfile::NamedTempFile::new().unwrap();
    let config = json!({
        "crasher": {
            "name": "crasher",
            "command": ["sh", "-c", script],
        }
    });
    agents_file.write_all(config.to_string().as_bytes()).unwrap();
    let db_file = tempfile::NamedTempFile::new().unwrap();

    let settings = Settings {
        auth_token: Some(AUTH_TOKEN.to_string()),
        agents_config_path: agents_file.path().to_path_buf(),
        database_path: db_file.path().to_string_lossy().to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        agent_working_dir: std::env::temp_dir(),
    };
    let registry = Arc::new(AgentRegistry::load(&settings.agents_config_path).unwrap());
    let session_store = Arc::new(SessionStore::connect(&settings.database_path).await.unwrap());
    let state = GatewayState {
        registry,
        run_manager: Arc::new(RunManager::new()),
        session_store,
        settings: Arc::new(settings),
    };
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let response = client()
        .post(format!("http://{addr}/runs"))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "agent": "crasher",
            "input": { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
            "mode": "sync"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn agent_config_failure_to_spawn_yields_bad_gateway() {
    let mut agents_file = tempfile::NamedTempFile::new().unwrap();
    let config = json!({
        "broken": {
            "name": "broken",
            "command": ["/nonexistent/path/to/binary"],
        }
    });
    agents_file.write_all(config.to_string().as_bytes()).unwrap();
    let db_file = tempfile::NamedTempFile::new().unwrap();

    let settings = Settings {
        auth_token: Some(AUTH_TOKEN.to_string()),
        agents_config_path: agents_file.path().to_path_buf(),
        database_path: db_file.path().to_string_lossy().to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        agent_working_dir: std::env::temp_dir(),
    };
    let registry = Arc::new(AgentRegistry::load(&settings.agents_config_path).unwrap());
    let session_store = Arc::new(SessionStore::connect(&settings.database_path).await.unwrap());
    let state = GatewayState {
        registry,
        run_manager: Arc::new(RunManager::new()),
        session_store,
        settings: Arc::new(settings),
    };
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let response = client()
        .post(format!("http://{addr}/runs"))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "agent": "broken",
            "input": { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
            "mode": "sync"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}
