//! Minimal Agent-RPC agent used as a fixture by the integration tests.
//! Speaks just enough of the protocol to exercise `initialize`,
//! `session/new`, `session/prompt`, and `session/cancel`: on a prompt it
//! streams the request text back one word at a time, checking for
//! cancellation between words, and stops after two seconds regardless.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

const SESSION_ID: &str = "session-test";

fn send(payload: &Value) {
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{payload}");
    let _ = stdout.flush();
}

fn handle_initialize(message: &Value) {
    send(&json!({ "jsonrpc": "2.0", "id": message["id"], "result": { "capabilities": {} } }));
}

fn handle_session_new(message: &Value) {
    send(&json!({ "jsonrpc": "2.0", "id": message["id"], "result": { "sessionId": SESSION_ID } }));
}

fn prompt_text(message: &Value) -> String {
    let mut text = String::new();
    if let Some(items) = message.pointer("/params/prompt").and_then(Value::as_array) {
        for item in items {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(part) = item.get("text").and_then(Value::as_str) {
                    text.push_str(part);
                }
            }
        }
    }
    text
}

fn handle_session_prompt(message: &Value, cancel: Arc<AtomicBool>, current_request: Arc<AtomicI64>) {
    cancel.store(false, Ordering::SeqCst);
    let id = message["id"].as_i64().unwrap_or(-1);
    current_request.store(id, Ordering::SeqCst);

    let text = prompt_text(message);
    eprintln!("dummy agent prompt: {text}");

    std::thread::spawn(move || {
        let start = Instant::now();
        let mut words: Vec<&str> = text.split_whitespace().collect();
        loop {
            std::thread::sleep(Duration::from_millis(50));
            if cancel.load(Ordering::SeqCst) {
                eprintln!("dummy agent prompt cancelled");
                current_request.store(-1, Ordering::SeqCst);
                return;
            }
            if !words.is_empty() {
                let word = words.remove(0);
                send(&json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {
                        "sessionId": SESSION_ID,
                        "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": { "type": "text", "text": format!("{word} ") }
                        }
                    }
                }));
                if cancel.load(Ordering::SeqCst) {
                    eprintln!("dummy agent prompt cancelled after sending message");
                    current_request.store(-1, Ordering::SeqCst);
                    return;
                }
            }
            if start.elapsed() >= Duration::from_secs(2) {
                break;
            }
        }
        send(&json!({ "jsonrpc": "2.0", "id": id, "result": { "stopReason": "stop" } }));
        current_request.store(-1, Ordering::SeqCst);
    });
}

fn handle_session_cancel(cancel: Arc<AtomicBool>, current_request: Arc<AtomicI64>) {
    eprintln!("dummy agent: cancel received");
    cancel.store(true, Ordering::SeqCst);
    send(&json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": SESSION_ID,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "cancel acknowledged" }
            }
        }
    }));
    send(&json!({ "jsonrpc": "2.0", "method": "session/cancelled", "params": { "sessionId": SESSION_ID } }));
    let request_id = current_request.swap(-1, Ordering::SeqCst);
    if request_id >= 0 {
        send(&json!({ "jsonrpc": "2.0", "id": request_id, "error": { "code": 499, "message": "cancelled" } }));
    }
}

fn main() {
    let cancel = Arc::new(AtomicBool::new(false));
    let current_request = Arc::new(AtomicI64::new(-1));
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            "initialize" => handle_initialize(&message),
            "session/new" => handle_session_new(&message),
            "session/prompt" => handle_session_prompt(&message, cancel.clone(), current_request.clone()),
            "session/cancel" => {
                handle_session_cancel(cancel.clone(), current_request.clone());
                break;
            }
            _ => continue,
        }
    }
}
