//! Conversation runtime: artifact store, upload interception, tool mediation
//! and the reasoning loop that ties them together.

pub mod binder;
pub mod db;
pub mod enrichment;
pub mod interceptor;
pub mod llm;
pub mod mediator;
pub mod runtime;
pub mod sqlite_store;
pub mod store;
pub mod tool_registry;
pub mod turn_log;

/// Per-conversation name bindings and the open-conversation registry.
pub use binder::{ContextBinder, ConversationRegistry, SharedBinder};
/// Upload interception stage.
pub use interceptor::{DEFAULT_MAX_UPLOAD_BYTES, InterceptedTurn, UploadInterceptor};
/// Chat request/response models and provider interfaces.
pub use llm::{ChatRequest, ChatResponse, LlmProvider, OpenAiProvider};
/// Tool invocation mediation.
pub use mediator::{InvocationOutcome, ToolInvocation, ToolMediator};
/// Main runtime orchestration loop.
pub use runtime::{CloseReport, RuntimeOptions, StudioRuntime};
/// SQLite-backed artifact store.
pub use sqlite_store::SqliteArtifactStore;
/// Artifact store interface and the in-memory implementation.
pub use store::{ArtifactStore, MemoryArtifactStore};
/// Runtime tool registry.
pub use tool_registry::ToolRegistry;
/// SQLite-backed conversation transcript.
pub use turn_log::{ConversationSummary, TurnLog};
