use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactRef, MediaKind};
use crate::message::ConversationId;

/// Raw media attached to an inbound turn.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    /// Original filename, when the transport provided one.
    pub filename: Option<String>,
    pub data: Vec<u8>,
    pub declared_mime_type: String,
}

impl MediaAttachment {
    pub fn new(
        filename: Option<String>,
        data: Vec<u8>,
        declared_mime_type: impl Into<String>,
    ) -> Self {
        Self {
            filename,
            data,
            declared_mime_type: declared_mime_type.into(),
        }
    }

    /// Label used when reporting on this item (filename or MIME type).
    pub fn label(&self) -> &str {
        self.filename
            .as_deref()
            .unwrap_or(self.declared_mime_type.as_str())
    }
}

impl std::fmt::Debug for MediaAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAttachment")
            .field("filename", &self.filename)
            .field("len", &self.data.len())
            .field("declared_mime_type", &self.declared_mime_type)
            .finish()
    }
}

/// One ordered piece of a user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPart {
    Text(String),
    /// Raw media as received from the transport.
    Media(MediaAttachment),
    /// Identifier line that replaced a stored upload.
    Reference { name: String, media_kind: MediaKind },
}

impl TurnPart {
    /// Renders the part as transcript text. Raw media never renders its bytes.
    pub fn render(&self) -> String {
        match self {
            TurnPart::Text(text) => text.clone(),
            TurnPart::Media(media) => format!("[unprocessed attachment: {}]", media.label()),
            TurnPart::Reference { name, media_kind } => format!("{name} ({media_kind})"),
        }
    }
}

/// Inbound user turn
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub conversation_id: ConversationId,
    pub parts: Vec<TurnPart>,
}

impl InboundTurn {
    /// Creates a text-only turn.
    pub fn text(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            parts: vec![TurnPart::Text(text.into())],
        }
    }

    /// Appends a raw media item.
    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.parts.push(TurnPart::Media(media));
        self
    }

    /// Joins the rendered parts with newlines, skipping empty text.
    pub fn render(&self) -> String {
        self.parts
            .iter()
            .map(TurnPart::render)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Returns `true` when any raw media remains in the turn.
    pub fn has_raw_media(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, TurnPart::Media(_)))
    }
}

/// An upload that the interceptor refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedUpload {
    pub item: String,
    pub reason: String,
}

/// A tool invocation that failed without terminating the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub call_id: String,
    pub tool_name: String,
    pub error_kind: String,
    pub message: String,
}

/// Outbound response for one completed turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub conversation_id: ConversationId,
    /// Final assistant text.
    pub content: String,
    /// Artifacts written during this turn, in commit order.
    pub produced: Vec<ArtifactRef>,
    pub failed_steps: Vec<FailedStep>,
    pub rejected_uploads: Vec<RejectedUpload>,
}

impl AgentResponse {
    pub fn new(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            produced: Vec::new(),
            failed_steps: Vec::new(),
            rejected_uploads: Vec::new(),
        }
    }
}

/// Real-time progress events emitted while a turn is processed.
///
/// Sent over `tokio::sync::mpsc` so a terminal front-end can show
/// upload and tool-call status while the reasoning loop runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// An attached media item was stored.
    UploadStored { artifact: ArtifactRef, media_kind: MediaKind },
    /// An attached media item was refused.
    UploadRejected { item: String, reason: String },
    /// The reasoning engine is being consulted (round N).
    Thinking { round: usize },
    /// A tool invocation has been dispatched.
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        inputs: Vec<String>,
    },
    /// A tool invocation has finished (successfully or not).
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: Option<ArtifactRef>,
        error: Option<String>,
    },
}
