//! Artifact identity and metadata types.
//!
//! An artifact is an immutable media payload addressed by
//! `(conversation, name, version)`. Every write to a name allocates the next
//! version; the current artifact for a name is its highest version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::message::ConversationId;

/// `produced_by` value for artifacts created by the upload interceptor.
pub const PRODUCED_BY_UPLOAD: &str = "upload";

/// Broad media class of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classifies a MIME type by its top-level type. Returns `None` for
    /// anything that is neither `image/*` nor `video/*`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let top = mime.split('/').next()?.trim().to_ascii_lowercase();
        match top.as_str() {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Returns the canonical lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    /// Default MIME type used when a backend does not report one.
    pub fn default_mime(self) -> &'static str {
        match self {
            MediaKind::Image => "image/png",
            MediaKind::Video => "video/mp4",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(ProtoError::InvalidMediaKind(other.to_string())),
        }
    }
}

/// File extension for a MIME subtype (`image/jpeg` -> `jpeg`).
pub fn mime_extension(mime: &str) -> &str {
    let subtype = mime.rsplit('/').next().unwrap_or(mime);
    let subtype = subtype.split(';').next().unwrap_or(subtype).trim();
    match subtype {
        "svg+xml" => "svg",
        "quicktime" => "mov",
        "" => "bin",
        other => other,
    }
}

/// A concrete `(name, version)` pair inside one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub version: u32,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Splits a `name@vN` pin into its parts. Plain names yield `None` for the version.
    pub fn split_pin(reference: &str) -> Result<(&str, Option<u32>), ProtoError> {
        let Some((name, version)) = reference.rsplit_once("@v") else {
            return Ok((reference, None));
        };
        if name.is_empty() {
            return Err(ProtoError::InvalidReference(reference.to_string()));
        }
        let version = version
            .parse::<u32>()
            .map_err(|_| ProtoError::InvalidReference(reference.to_string()))?;
        Ok((name, Some(version)))
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Metadata record stored alongside every artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub conversation_id: ConversationId,
    pub name: String,
    /// Starts at 0 and increments by one per write to the same name.
    pub version: u32,
    pub media_kind: MediaKind,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    /// Tool name, or [`PRODUCED_BY_UPLOAD`].
    pub produced_by: String,
    /// Lineage: the artifact versions this one was derived from, in call order.
    pub inputs: Vec<ArtifactRef>,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the payload.
    pub sha256: String,
}

impl ArtifactMeta {
    pub fn artifact_ref(&self) -> ArtifactRef {
        ArtifactRef::new(self.name.clone(), self.version)
    }
}

/// An immutable artifact payload plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub data: Vec<u8>,
}

/// One entry of the per-conversation artifact listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub latest_version: u32,
    pub media_kind: MediaKind,
    pub produced_by: String,
}

/// Everything `put` needs besides the conversation id.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub name: String,
    pub data: Vec<u8>,
    pub media_kind: MediaKind,
    pub mime_type: String,
    pub produced_by: String,
    pub inputs: Vec<ArtifactRef>,
}

impl NewArtifact {
    /// Builds an upload record (no lineage, `produced_by = "upload"`).
    pub fn upload(
        name: impl Into<String>,
        data: Vec<u8>,
        media_kind: MediaKind,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            media_kind,
            mime_type: mime_type.into(),
            produced_by: PRODUCED_BY_UPLOAD.to_string(),
            inputs: Vec::new(),
        }
    }
}
