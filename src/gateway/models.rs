//! Wire types shared by the Run API surface: requests, the `Run` record
//! itself, and the small message/manifest shapes that flow across the
//! HTTP boundary.
//!
//! These mirror the Pydantic models of the proxy this gateway replaces,
//! translated into plain `serde` structs/enums. `Run` is the one type
//! that the Run Manager, the orchestrator, and HTTP clients all agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution mode requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Sync,
    Stream,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Sync
    }
}

/// Lifecycle state of a [`Run`]. See the state machine in the component
/// design for the legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

/// A single content block. Only `text` blocks are supported today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type", default = "default_part_type")]
    pub part_type: String,
    pub text: String,
}

fn default_part_type() -> String {
    "text".to_string()
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            part_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Role of the speaker that produced a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A complete message: a role plus one or more content blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<MessagePart>,
}

impl Message {
    pub fn assistant_text(parts: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![MessagePart::text(parts.concat())],
        }
    }

    /// `true` if `content` is empty, the one structural invariant the Run
    /// API enforces on inbound messages (maps to HTTP 422 when violated).
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Structured error payload attached to a failed [`Run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One client-initiated prompt-and-response interaction with a chosen
/// agent. See the data model invariants: `output` is set only on
/// `completed`, `error` only on `failed`, `updated_at` never decreases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub agent: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Request payload for `POST /runs`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunCreateRequest {
    pub agent: String,
    pub input: Message,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Agent configuration loaded once at startup from `agents.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Public listing entry for `GET /agents`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared capabilities of an agent, synthesized rather than configured.
#[derive(Debug, Clone, Serialize)]
pub struct AgentManifestCapabilities {
    pub modes: Vec<RunMode>,
    pub supports_streaming: bool,
    pub supports_cancellation: bool,
}

/// Public manifest returned by `GET /agents/{name}`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentManifest {
    pub name: String,
    pub description: String,
    pub version: String,
    pub capabilities: AgentManifestCapabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_round_trips_through_json() {
        let original = AgentConfig {
            name: "test".to_string(),
            command: vec!["python3".to_string(), "agent.py".to_string()],
            description: Some("A test agent".to_string()),
            version: Some("0.2.0".to_string()),
            api_key: Some("sk-test".to_string()),
        };
        let json = serde_json::to_string(&original).unwrap();
        let parsed: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(original.name, parsed.name);
        assert_eq!(original.command, parsed.command);
        assert_eq!(original.description, parsed.description);
        assert_eq!(original.version, parsed.version);
        assert_eq!(original.api_key, parsed.api_key);
    }

    #[test]
    fn message_empty_content_is_detected() {
        let msg = Message {
            role: Role::User,
            content: vec![],
        };
        assert!(msg.is_empty());
    }

    #[test]
    fn run_serializes_optional_fields_only_when_present() {
        let run = Run {
            id: "r1".to_string(),
            agent: "test".to_string(),
            status: RunStatus::Queued,
            mode: RunMode::Sync,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            output: None,
            stop_reason: None,
            error: None,
        };
        let value = serde_json::to_value(&run).unwrap();
        assert!(value.get("output").is_none());
        assert!(value.get("stop_reason").is_none());
        assert!(value.get("error").is_none());
    }
}
