//! Media tool schemas and the backends that execute them.
//!
//! The agent runtime uses this crate to describe each tool to the reasoning
//! engine ([`ToolSpec`]) and to run the resolved invocation against a
//! [`MediaBackend`]: local pixel transforms, a remote generation service, or
//! a router that picks one per tool.

pub mod catalog;
pub mod http;
pub mod local;
pub mod router;

pub use catalog::{
    CLIP_DURATIONS, ClipOptions, InstructionRule, OutputNaming, ToolKind, ToolSpec, builtin_specs,
};
pub use http::HttpMediaBackend;
pub use local::LocalImageBackend;
pub use router::BackendRouter;

use async_trait::async_trait;
use proto::MediaKind;

/// One resolved input artifact handed to a backend.
#[derive(Clone)]
pub struct InputMedia {
    pub name: String,
    pub version: u32,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for InputMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputMedia")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Backend call for a single tool invocation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub tool_name: String,
    pub kind: ToolKind,
    /// Inputs in the order the tool call listed them.
    pub inputs: Vec<InputMedia>,
    /// Instruction after enrichment (may be empty for transform tools).
    pub instruction: String,
    pub output_kind: MediaKind,
    /// Video settings; empty for image tools.
    pub clip: ClipOptions,
}

/// Media returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedMedia {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Trait that all media generation/editing backends implement.
///
/// Failures are opaque diagnostic strings; the caller wraps them into a
/// `GenerationFailed` error. Implementations must not retry internally.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Produces one output blob from the ordered inputs and the instruction.
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedMedia, String>;
}
