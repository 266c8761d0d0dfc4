//! Tracks the lifecycle of active runs: one coarse lock guarding a map
//! from run id to [`RunState`], matching the concurrency model described
//! for this component — callers never see partial updates, and every
//! mutation is a single critical section.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::gateway::agent_connection::AgentConnection;
use crate::gateway::error::GatewayError;
use crate::gateway::models::{ErrorDetail, Message, MessagePart, Role, Run, RunMode, RunStatus};

/// Internal bookkeeping for one active run. Not exposed outside the
/// gateway module; callers only ever see the public [`Run`] snapshot.
struct RunState {
    run: Run,
    connection: Option<Arc<AgentConnection>>,
    session_id: Option<String>,
    buffered_parts: Vec<MessagePart>,
    cancel_tx: watch::Sender<bool>,
}

/// Owns every run's state behind a single `tokio::sync::Mutex`.
pub struct RunManager {
    runs: Mutex<HashMap<String, RunState>>,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RunManager {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_run(&self, agent: &str, mode: RunMode) -> Run {
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let run = Run {
            id: run_id.clone(),
            agent: agent.to_string(),
            mode,
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            output: None,
            stop_reason: None,
            error: None,
        };
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let state = RunState {
            run: run.clone(),
            connection: None,
            session_id: None,
            buffered_parts: Vec::new(),
            cancel_tx,
        };
        self.runs.lock().await.insert(run_id.clone(), state);
        debug!("created run {run_id} for agent {agent}");
        run
    }

    pub async fn start_run(
        &self,
        run_id: &str,
        connection: Arc<AgentConnection>,
    ) -> Result<(), GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        state.run.status = RunStatus::InProgress;
        state.run.updated_at = Utc::now();
        state.connection = Some(connection);
        Ok(())
    }

    pub async fn set_session_id(&self, run_id: &str, session_id: &str) -> Result<(), GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        state.session_id = Some(session_id.to_string());
        Ok(())
    }

    pub async fn append_output_part(&self, run_id: &str, text: &str) -> Result<(), GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        state.buffered_parts.push(MessagePart::text(text));
        debug!(
            "run {run_id}: appended output part ({} total)",
            state.buffered_parts.len()
        );
        Ok(())
    }

    pub async fn complete_run(
        &self,
        run_id: &str,
        stop_reason: Option<String>,
    ) -> Result<Run, GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        state.run.status = RunStatus::Completed;
        state.run.stop_reason = stop_reason;
        state.run.updated_at = Utc::now();
        if !state.buffered_parts.is_empty() {
            state.run.output = Some(Message {
                role: Role::Assistant,
                content: state.buffered_parts.clone(),
            });
        } else {
            warn!("run {run_id}: completed with no buffered output parts");
        }
        state.connection = None;
        Ok(state.run.clone())
    }

    pub async fn fail_run(&self, run_id: &str, error: &str, code: &str) -> Result<Run, GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        state.run.status = RunStatus::Failed;
        state.run.updated_at = Utc::now();
        state.run.error = Some(ErrorDetail {
            code: code.to_string(),
            message: error.to_string(),
            data: None,
        });
        state.connection = None;
        Ok(state.run.clone())
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Run, GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        state.run.status = RunStatus::Cancelled;
        state.run.updated_at = Utc::now();
        state.connection = None;
        Ok(state.run.clone())
    }

    /// Idempotent: repeated calls on an already-cancelling run just
    /// re-fire the cancel signal and return the current snapshot.
    pub async fn request_cancel(&self, run_id: &str) -> Result<Run, GatewayError> {
        let mut runs = self.runs.lock().await;
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        if state.run.status != RunStatus::Cancelling {
            state.run.status = RunStatus::Cancelling;
            state.run.updated_at = Utc::now();
        }
        state.cancel_tx.send_replace(true);
        debug!("cancellation requested for run {run_id}");
        Ok(state.run.clone())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, GatewayError> {
        let runs = self.runs.lock().await;
        runs.get(run_id)
            .map(|state| state.run.clone())
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))
    }

    pub async fn pop(&self, run_id: &str) {
        self.runs.lock().await.remove(run_id);
        debug!("run {run_id} removed");
    }

    pub async fn connection_for(&self, run_id: &str) -> Option<Arc<AgentConnection>> {
        self.runs.lock().await.get(run_id)?.connection.clone()
    }

    pub async fn session_for(&self, run_id: &str) -> Option<String> {
        self.runs.lock().await.get(run_id)?.session_id.clone()
    }

    /// Polls for a session id to appear, backing off in 50ms steps until
    /// `timeout` elapses. Not called by the orchestrator today (sessions
    /// are created synchronously before `start_run`), kept for parity and
    /// for any future caller that races session creation against a run.
    pub async fn wait_for_session(&self, run_id: &str, timeout: std::time::Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(session_id) = self.session_for(run_id).await {
                return Some(session_id);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    pub async fn cancel_event_for(&self, run_id: &str) -> Result<watch::Receiver<bool>, GatewayError> {
        let runs = self.runs.lock().await;
        runs.get(run_id)
            .map(|state| state.cancel_tx.subscribe())
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let manager = RunManager::new();
        let run = manager.create_run("test", RunMode::Sync).await;
        let fetched = manager.get_run(&run.id).await.unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn complete_run_materializes_output_only_when_nonempty() {
        let manager = RunManager::new();
        let run = manager.create_run("test", RunMode::Sync).await;
        let completed = manager.complete_run(&run.id, Some("stop".to_string())).await.unwrap();
        assert_eq!(completed.status, RunStatus::Completed);
        assert!(completed.output.is_none());

        let run2 = manager.create_run("test", RunMode::Sync).await;
        manager.append_output_part(&run2.id, "hello ").await.unwrap();
        let completed2 = manager.complete_run(&run2.id, None).await.unwrap();
        assert!(completed2.output.is_some());
    }

    #[tokio::test]
    async fn request_cancel_is_idempotent_and_sets_a_persisted_flag() {
        let manager = RunManager::new();
        let run = manager.create_run("test", RunMode::Sync).await;

        // Subscribe before the cancel is requested, matching a receiver
        // that was already awaiting when the run started.
        let mut early_rx = manager.cancel_event_for(&run.id).await.unwrap();
        assert!(!*early_rx.borrow());

        let first = manager.request_cancel(&run.id).await.unwrap();
        assert_eq!(first.status, RunStatus::Cancelling);
        let second = manager.request_cancel(&run.id).await.unwrap();
        assert_eq!(second.status, RunStatus::Cancelling);

        // The flag is level-triggered: a receiver created after the cancel
        // still observes it immediately, unlike a lost edge-triggered wakeup.
        let late_rx = manager.cancel_event_for(&run.id).await.unwrap();
        assert!(*late_rx.borrow());

        early_rx.changed().await.unwrap();
        assert!(*early_rx.borrow());
    }

    #[tokio::test]
    async fn missing_run_operations_error() {
        let manager = RunManager::new();
        assert!(manager.get_run("does-not-exist").await.is_err());
        assert!(manager.cancel_run("does-not-exist").await.is_err());
    }
}
