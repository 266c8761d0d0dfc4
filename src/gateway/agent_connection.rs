//! Subprocess side of the gateway: spawns an Agent-RPC agent, speaks its
//! newline-delimited JSON-RPC dialect over stdin/stdout, and exposes the
//! handful of operations the orchestrator needs (`initialize`,
//! `start_session`, `prompt`, `cancel`, `close`).
//!
//! Framing is deliberately tolerant: blank lines and lines that don't
//! start with `{` are treated as incidental log output on stdout rather
//! than protocol errors, mirroring what real agent binaries do when they
//! print banners before speaking JSON-RPC.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::timeout;

use crate::gateway::error::AgentProcessError;
use crate::gateway::models::MessagePart;

const STDERR_TAIL_LINES: usize = 50;
const SPAWN_RETRY_ATTEMPTS: u32 = 5;
const SPAWN_RETRY_BASE_DELAY: Duration = Duration::from_millis(2);
const SPAWN_RETRY_MAX_DELAY: Duration = Duration::from_millis(50);
const CLOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
const CLOSE_KILL_TIMEOUT: Duration = Duration::from_secs(2);
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a prompt that ran to completion. Cancellation is never
/// represented here — it's always an `AgentProcessError::Cancelled`, so
/// callers can't forget to check for it.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub stop_reason: Option<String>,
}

/// A live connection to a spawned agent subprocess.
///
/// `request`/`notify` serialize access to stdin/stdout via their own
/// locks, but the Run Manager is responsible for ensuring at most one
/// `prompt` is outstanding on a connection at a time — this type does not
/// enforce that itself.
pub struct AgentConnection {
    child: AsyncMutex<Child>,
    stdin: AsyncMutex<BufWriter<ChildStdin>>,
    stdout: AsyncMutex<BufReader<ChildStdout>>,
    next_id: AtomicI64,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl AgentConnection {
    /// Spawns `command` with `env` merged into the child's environment and
    /// begins collecting its stderr in the background. Retries a handful
    /// of times on a transient "text file busy" spawn failure.
    pub async fn start(
        command: &[String],
        env: &[(String, String)],
        working_dir: Option<&std::path::Path>,
    ) -> Result<Self, AgentProcessError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AgentProcessError::SpawnFailed("empty command".to_string()))?;

        let mut delay = SPAWN_RETRY_BASE_DELAY;
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..SPAWN_RETRY_ATTEMPTS {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }
            match cmd.spawn() {
                Ok(child) => return Self::from_child(child),
                Err(err) if is_text_file_busy(&err) && attempt + 1 < SPAWN_RETRY_ATTEMPTS => {
                    warn!(
                        "agent spawn hit a busy executable, retrying (attempt {}/{})",
                        attempt + 1,
                        SPAWN_RETRY_ATTEMPTS
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(SPAWN_RETRY_MAX_DELAY);
                    last_err = Some(err);
                }
                Err(err) => return Err(AgentProcessError::SpawnFailed(err.to_string())),
            }
        }
        Err(AgentProcessError::SpawnFailed(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "spawn retries exhausted".to_string()),
        ))
    }

    fn from_child(mut child: Child) -> Result<Self, AgentProcessError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentProcessError::SpawnFailed("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentProcessError::SpawnFailed("child has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentProcessError::SpawnFailed("child has no stderr".to_string()))?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail_for_task = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!(target: "agent_connection::stderr", "{line}");
                        let mut buf = tail_for_task.lock().unwrap();
                        if buf.len() == STDERR_TAIL_LINES {
                            buf.pop_front();
                        }
                        buf.push_back(line);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        error!("error reading agent stderr: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: AsyncMutex::new(child),
            stdin: AsyncMutex::new(BufWriter::new(stdin)),
            stdout: AsyncMutex::new(BufReader::new(stdout)),
            next_id: AtomicI64::new(1),
            stderr_tail,
        })
    }

    fn stderr_tail_text(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn write_value(&self, value: &Value) -> Result<(), AgentProcessError> {
        let mut line = serde_json::to_string(value)
            .map_err(|err| AgentProcessError::Protocol(err.to_string()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AgentProcessError::Crashed {
                stderr_tail: format!("{err}; {}", self.stderr_tail_text()),
            })?;
        stdin
            .flush()
            .await
            .map_err(|err| AgentProcessError::Crashed {
                stderr_tail: format!("{err}; {}", self.stderr_tail_text()),
            })
    }

    /// Reads and parses the next well-formed JSON object from stdout,
    /// silently skipping blank lines and non-JSON noise. Returns an error
    /// if stdout closes (the agent has exited).
    async fn read_frame(&self) -> Result<Value, AgentProcessError> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let mut line = String::new();
            let n = stdout
                .read_line(&mut line)
                .await
                .map_err(|err| AgentProcessError::Crashed {
                    stderr_tail: format!("{err}; {}", self.stderr_tail_text()),
                })?;
            if n == 0 {
                return Err(AgentProcessError::Crashed {
                    stderr_tail: self.stderr_tail_text(),
                });
            }
            let trimmed = line.trim();
            if trimmed.is_empty() || !trimmed.starts_with('{') {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    debug!("skipping malformed agent frame: {err}");
                    continue;
                }
            }
        }
    }

    /// Sends a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), AgentProcessError> {
        self.write_value(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Sends a JSON-RPC request and blocks until the matching response
    /// arrives, dispatching any interleaved notifications to `on_notification`.
    async fn request(
        &self,
        method: &str,
        params: Value,
        mut on_notification: impl FnMut(&Value),
    ) -> Result<Value, AgentProcessError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_value(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        self.read_until_response(id, &mut on_notification).await
    }

    async fn read_until_response(
        &self,
        id: i64,
        on_notification: &mut impl FnMut(&Value),
    ) -> Result<Value, AgentProcessError> {
        loop {
            let frame = self.read_frame().await?;
            match frame.get("id").and_then(Value::as_i64) {
                Some(frame_id) if frame_id == id => {
                    if let Some(error) = frame.get("error") {
                        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
                        let message = error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string();
                        return Err(AgentProcessError::Remote { code, message });
                    }
                    return Ok(frame.get("result").cloned().unwrap_or(Value::Null));
                }
                _ => on_notification(&frame),
            }
        }
    }

    /// `initialize` handshake. If the agent reports any `authMethods`, this
    /// authenticates with the `apikey` method when `api_key` is available,
    /// and fails clearly otherwise rather than proceeding unauthenticated.
    pub async fn initialize(&self, api_key: Option<&str>) -> Result<Value, AgentProcessError> {
        let result = self
            .request(
                "initialize",
                json!({ "protocolVersion": "v1", "clientName": "cli", "capabilities": {} }),
                |_| {},
            )
            .await?;

        let auth_methods = result
            .get("authMethods")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if auth_methods.is_empty() {
            return Ok(result);
        }

        let supports_apikey = auth_methods
            .iter()
            .any(|method| method.get("id").and_then(Value::as_str) == Some("apikey"));
        match (supports_apikey, api_key) {
            (true, Some(key)) => {
                self.authenticate("apikey", key).await?;
                Ok(result)
            }
            (true, None) => Err(AgentProcessError::Protocol(
                "agent requires API key authentication but no API key was configured".to_string(),
            )),
            (false, _) => {
                let ids: Vec<&str> = auth_methods
                    .iter()
                    .filter_map(|method| method.get("id").and_then(Value::as_str))
                    .collect();
                Err(AgentProcessError::Protocol(format!(
                    "agent requires authentication but no supported method is available: {ids:?}"
                )))
            }
        }
    }

    /// `authenticate`. The key itself travels to the agent via the
    /// subprocess environment (`OPENAI_API_KEY`, set at spawn time); this
    /// call only tells the agent which advertised method to use.
    async fn authenticate(&self, method_id: &str, _api_key: &str) -> Result<Value, AgentProcessError> {
        self.request("authenticate", json!({ "methodId": method_id }), |_| {}).await
    }

    /// `session/new`, returning the agent-assigned session id.
    pub async fn start_session(
        &self,
        working_dir: &str,
        mcp_servers: &[Value],
    ) -> Result<String, AgentProcessError> {
        let result = self
            .request(
                "session/new",
                json!({ "cwd": working_dir, "mcpServers": mcp_servers }),
                |_| {},
            )
            .await?;
        result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentProcessError::Protocol("session/new missing sessionId".to_string()))
    }

    /// `session/load`, tolerating agents that don't implement it.
    pub async fn load_session(
        &self,
        session_id: &str,
        working_dir: &str,
        mcp_servers: &[Value],
    ) -> Result<(), AgentProcessError> {
        self.request(
            "session/load",
            json!({ "sessionId": session_id, "cwd": working_dir, "mcpServers": mcp_servers }),
            |_| {},
        )
        .await
        .map(|_| ())
    }

    /// Issues `session/prompt` and races it against `cancel`. If the
    /// cancel signal fires first, sends `session/cancel` to the agent and
    /// waits a bounded amount of time for it to acknowledge before
    /// reporting the prompt cancelled regardless.
    pub async fn prompt(
        &self,
        session_id: &str,
        content: Vec<MessagePart>,
        cancel: &mut watch::Receiver<bool>,
        mut on_chunk: impl FnMut(String),
    ) -> Result<PromptOutcome, AgentProcessError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_value(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "session/prompt",
            "params": { "sessionId": session_id, "prompt": content },
        }))
        .await?;

        if *cancel.borrow() {
            debug!("cancel already requested before prompt started, notifying agent");
            self.notify("session/cancel", json!({ "sessionId": session_id })).await?;
            return self.drain_after_cancel(id, &mut on_chunk).await;
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    if !*cancel.borrow() {
                        continue;
                    }
                    debug!("cancel signal observed, notifying agent");
                    self.notify("session/cancel", json!({ "sessionId": session_id })).await?;
                    return self.drain_after_cancel(id, &mut on_chunk).await;
                }
                frame = self.read_frame() => {
                    let frame = frame?;
                    match self.dispatch_prompt_frame(&frame, id, &mut on_chunk)? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Drains frames after a cancel signal has been sent to the agent,
    /// waiting up to `CANCEL_DRAIN_TIMEOUT` for it to acknowledge. Every
    /// terminal path here is a cancellation — a genuine remote error still
    /// propagates as such rather than being papered over.
    async fn drain_after_cancel(
        &self,
        id: i64,
        on_chunk: &mut impl FnMut(String),
    ) -> Result<PromptOutcome, AgentProcessError> {
        let result = timeout(CANCEL_DRAIN_TIMEOUT, async {
            loop {
                let frame = self.read_frame().await?;
                if let Some(outcome) = self.dispatch_prompt_frame(&frame, id, on_chunk)? {
                    return Ok(outcome);
                }
            }
        })
        .await;

        match result {
            Ok(Ok(_outcome)) => Err(AgentProcessError::Cancelled(
                "agent acknowledged cancellation".to_string(),
            )),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(AgentProcessError::Cancelled(
                "cancellation requested; agent did not acknowledge in time".to_string(),
            )),
        }
    }

    /// Inspects one frame read while a `session/prompt` is outstanding.
    /// Returns `Ok(Some(outcome))` on normal completion, `Ok(None)` for a
    /// frame that was handled but isn't terminal (e.g. a chunk), and
    /// `Err` for either a genuine remote error or an observed cancellation.
    fn dispatch_prompt_frame(
        &self,
        frame: &Value,
        id: i64,
        on_chunk: &mut impl FnMut(String),
    ) -> Result<Option<PromptOutcome>, AgentProcessError> {
        if frame.get("id").and_then(Value::as_i64) == Some(id) {
            if let Some(error) = frame.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(AgentProcessError::Remote { code, message });
            }
            let stop_reason = frame
                .get("result")
                .and_then(|r| r.get("stopReason"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Some(PromptOutcome { stop_reason }));
        }

        if frame.get("method").and_then(Value::as_str) == Some("session/cancelled") {
            return Err(AgentProcessError::Cancelled(
                "agent sent a session/cancelled notification".to_string(),
            ));
        }

        if frame.get("method").and_then(Value::as_str) == Some("session/update") {
            let update = frame.pointer("/params/update");
            if update.and_then(|u| u.get("sessionUpdate")).and_then(Value::as_str)
                == Some("session/cancelled")
            {
                return Err(AgentProcessError::Cancelled(
                    "agent reported session/cancelled via session/update".to_string(),
                ));
            }
            if let Some(text) = update.and_then(|u| u.pointer("/content/text")).and_then(Value::as_str) {
                on_chunk(text.to_string());
            }
        }
        Ok(None)
    }

    /// `session/cancel` outside of an in-flight prompt race; always a
    /// fire-and-forget notification.
    pub async fn cancel(&self, session_id: &str) -> Result<(), AgentProcessError> {
        self.notify("session/cancel", json!({ "sessionId": session_id })).await
    }

    /// Closes stdin, waits briefly for a graceful exit, then escalates to
    /// killing the process if it hasn't exited in time.
    pub async fn close(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        if timeout(CLOSE_WAIT_TIMEOUT, child.wait()).await.is_ok() {
            return;
        }
        if child.start_kill().is_err() {
            return;
        }
        let _ = timeout(CLOSE_KILL_TIMEOUT, child.wait()).await;
    }
}

fn is_text_file_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(26)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_text_file_busy_matches_etxtbsy_only() {
        let busy = std::io::Error::from_raw_os_error(26);
        assert!(is_text_file_busy(&busy));
        let other = std::io::Error::from_raw_os_error(2);
        assert!(!is_text_file_busy(&other));
    }
}
