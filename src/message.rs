/// Palette modes and the chat data model shared by the controller, the
/// history store and the transports.
use serde::{Deserialize, Serialize};

// ── Mode / status ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Command,
    Chat,
}

/// Lifecycle of the current chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    #[default]
    Idle,
    /// Sent, waiting for the first token
    Submitted,
    Streaming,
    Error,
}

impl ChatStatus {
    pub fn is_loading(self) -> bool {
        matches!(self, ChatStatus::Submitted | ChatStatus::Streaming)
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    /// The tool runs without asking
    #[default]
    NotRequired,
    Pending,
    Approved,
    Rejected,
}

impl Approval {
    pub fn is_decided(self) -> bool {
        matches!(self, Approval::Approved | Approval::Rejected)
    }
}

/// A tool invocation proposed by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub approval: Approval,
}

impl ToolCall {
    pub fn needs_decision(&self) -> bool {
        self.approval == Approval::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set when the request that produced this message failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        self.tool_calls.iter_mut().find(|c| c.id == id)
    }
}

/// A user decision on a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalDecision<'a> {
    pub id: &'a str,
    pub approved: bool,
}
