use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Reasoning engine (LLM provider) error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Transcript database error.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Artifact store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Upload interception error.
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// Tool invocation error.
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),

    /// The enclosing turn was cancelled.
    #[error("Turn cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM provider errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote API failure.
    #[error("{0}")]
    Api(String),

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Runtime exceeded configured tool-call rounds.
    #[error("Max tool rounds exceeded")]
    MaxToolRoundsExceeded,

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transcript database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Requested record was not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Artifact store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Read of an unknown name, or of a version above the latest.
    #[error("Artifact not found: {name}{} in conversation {conversation}", version_suffix(.version))]
    NotFound {
        conversation: String,
        name: String,
        version: Option<u32>,
    },

    /// Backing storage failed to read or durably write.
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Stored record could not be decoded.
    #[error("Corrupt artifact record: {0}")]
    Corrupt(String),
}

fn version_suffix(version: &Option<u32>) -> String {
    version.map(|v| format!("@v{v}")).unwrap_or_default()
}

impl StoreError {
    /// Returns `true` for failures that must terminate the turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Storage(_) | StoreError::Corrupt(_))
    }
}

/// Upload interception errors (item-scoped)
#[derive(Debug, Error)]
pub enum UploadError {
    /// A single attached media item was refused.
    #[error("Media rejected ({item}): {reason}")]
    MediaRejected { item: String, reason: String },
}

/// Tool invocation errors (invocation-scoped unless wrapping a fatal store error)
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Requested tool is unknown.
    #[error("Tool not found: {0}")]
    UnknownTool(String),

    /// Tool call arguments are invalid.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// An edit/combine/animate tool was called without any input artifact.
    #[error("Tool '{tool}' requires at least {required} input artifact(s)")]
    MissingInput { tool: String, required: usize },

    /// An input reference is not known in this conversation.
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    /// The media backend reported a failure.
    #[error("Generation failed for '{tool}': {diagnostic}")]
    GenerationFailed { tool: String, diagnostic: String },

    /// The enclosing turn was cancelled before the result was committed.
    #[error("Invocation cancelled")]
    Cancelled,

    /// Artifact store failure while reading inputs or committing output.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl InvocationError {
    /// Returns `true` when the failure must terminate the turn.
    pub fn is_fatal(&self) -> bool {
        match self {
            InvocationError::Store(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Short machine-readable label used in tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::UnknownTool(_) => "unknown_tool",
            InvocationError::InvalidArgs(_) => "invalid_args",
            InvocationError::MissingInput { .. } => "missing_input",
            InvocationError::UnresolvedReference(_) => "unresolved_reference",
            InvocationError::GenerationFailed { .. } => "generation_failed",
            InvocationError::Cancelled => "cancelled",
            InvocationError::Store(StoreError::NotFound { .. }) => "not_found",
            InvocationError::Store(_) => "storage",
        }
    }
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid media kind string value.
    #[error("Invalid media kind: {0}")]
    InvalidMediaKind(String),

    /// Malformed artifact reference string.
    #[error("Invalid artifact reference: {0}")]
    InvalidReference(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
