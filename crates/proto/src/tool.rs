use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tool call requested by the reasoning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier assigned by the reasoning engine.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Raw JSON arguments, validated against the tool's schema by the mediator.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Creates a tool call with a fresh random id.
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// Tool declaration offered to the reasoning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted arguments.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Outcome of one tool call as reported back to the reasoning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    /// JSON-encoded result body.
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            is_error: false,
        }
    }

    /// Creates a failed tool result.
    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            is_error: true,
            ..Self::success(call_id, tool_name, output)
        }
    }
}
