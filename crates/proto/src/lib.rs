//! Shared protocol types for the studio runtime, media tools, and CLI.
//!
//! This crate defines serializable conversation, artifact, and tool
//! structures and the strongly-typed error taxonomy shared across the
//! workspace.

pub mod artifact;
pub mod error;
pub mod event;
pub mod message;
pub mod tool;

/// Re-export of artifact identity and metadata types.
pub use artifact::{
    Artifact, ArtifactMeta, ArtifactRef, ArtifactSummary, MediaKind, NewArtifact,
    PRODUCED_BY_UPLOAD, mime_extension,
};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of inbound/outbound turn types.
pub use event::{
    AgentResponse, FailedStep, InboundTurn, MediaAttachment, ProgressEvent, RejectedUpload,
    TurnPart,
};
/// Re-export of conversation/message identity types.
pub use message::{AgentMessage, ConversationId, Role};
/// Re-export of tool call definition and result types.
pub use tool::{ToolCall, ToolDefinition, ToolResult};
