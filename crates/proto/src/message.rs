use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Creates a new random conversation identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the raw conversation identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message authored by the end user (uploads already replaced by references).
    User,
    /// Message authored by the assistant.
    Assistant,
    /// System-level instruction message.
    System,
    /// Tool invocation result message.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(crate::error::ProtoError::InvalidRole(other.to_string())),
        }
    }
}

/// One entry of a conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message id.
    pub id: String,
    /// Conversation that owns this message.
    pub conversation_id: ConversationId,
    /// Semantic role of this message.
    pub role: Role,
    /// Message text. Never carries raw media bytes.
    pub content: String,
    /// Tool call id when role is `Tool`.
    pub tool_call_id: Option<String>,
    /// Tool name when role is `Tool`.
    pub tool_name: Option<String>,
    /// Tool calls requested by the assistant when role is `Assistant`.
    pub tool_calls: Option<Vec<crate::tool::ToolCall>>,
    /// Message creation timestamp in UTC.
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    /// Creates a plain transcript message for the given conversation/role.
    pub fn new(conversation_id: ConversationId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
            created_at: Utc::now(),
        }
    }

    /// Creates an assistant message carrying tool calls.
    pub fn assistant_tool_calls(
        conversation_id: ConversationId,
        tool_calls: Vec<crate::tool::ToolCall>,
    ) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::new(conversation_id, Role::Assistant, String::new())
        }
    }

    /// Creates a tool result message for the given tool call.
    pub fn tool_result(
        conversation_id: ConversationId,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(conversation_id, Role::Tool, content)
        }
    }
}
