//! Artifact store contract and the in-process implementation.
//!
//! Versions for a `(conversation, name)` pair form a gap-free sequence
//! starting at 0. `put` never overwrites; it allocates the next version and
//! returns once the payload is readable by `get`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use proto::{
    Artifact, ArtifactMeta, ArtifactSummary, ConversationId, NewArtifact, StoreError,
};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Durable, versioned storage of media blobs keyed by `(conversation, name)`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Appends a new version of `artifact.name` and returns its metadata.
    async fn put(
        &self,
        conversation: &ConversationId,
        artifact: NewArtifact,
    ) -> Result<ArtifactMeta, StoreError>;

    /// Reads one version, or the latest when `version` is `None`.
    async fn get(
        &self,
        conversation: &ConversationId,
        name: &str,
        version: Option<u32>,
    ) -> Result<Artifact, StoreError>;

    /// Latest version of every name, in order of first appearance.
    async fn list(&self, conversation: &ConversationId) -> Result<Vec<ArtifactSummary>, StoreError>;

    /// Metadata of every version of `name`, oldest first.
    async fn history(
        &self,
        conversation: &ConversationId,
        name: &str,
    ) -> Result<Vec<ArtifactMeta>, StoreError>;

    /// Removes every artifact of the conversation. Returns the number of
    /// versions removed.
    async fn delete_conversation(&self, conversation: &ConversationId) -> Result<u64, StoreError>;
}

/// Hex SHA-256 of a payload.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Builds the metadata record for a version about to be written.
pub(crate) fn build_meta(
    conversation: &ConversationId,
    artifact: &NewArtifact,
    version: u32,
) -> ArtifactMeta {
    ArtifactMeta {
        conversation_id: conversation.clone(),
        name: artifact.name.clone(),
        version,
        media_kind: artifact.media_kind,
        mime_type: artifact.mime_type.clone(),
        created_at: Utc::now(),
        produced_by: artifact.produced_by.clone(),
        inputs: artifact.inputs.clone(),
        size_bytes: artifact.data.len() as u64,
        sha256: sha256_hex(&artifact.data),
    }
}

pub(crate) fn not_found(
    conversation: &ConversationId,
    name: &str,
    version: Option<u32>,
) -> StoreError {
    StoreError::NotFound {
        conversation: conversation.to_string(),
        name: name.to_string(),
        version,
    }
}

struct NameSlot {
    first_seen: u64,
    versions: Vec<Artifact>,
}

/// In-process artifact store.
///
/// Each `(conversation, name)` slot lives behind its own map entry lock, so
/// writers to the same name are serialized and writers to different names
/// proceed independently.
#[derive(Default)]
pub struct MemoryArtifactStore {
    slots: DashMap<(ConversationId, String), NameSlot>,
    sequence: AtomicU64,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        conversation: &ConversationId,
        artifact: NewArtifact,
    ) -> Result<ArtifactMeta, StoreError> {
        let key = (conversation.clone(), artifact.name.clone());
        let mut slot = self.slots.entry(key).or_insert_with(|| NameSlot {
            first_seen: self.sequence.fetch_add(1, Ordering::Relaxed),
            versions: Vec::new(),
        });

        let version = u32::try_from(slot.versions.len())
            .map_err(|_| StoreError::Storage(format!("version overflow for {}", artifact.name)))?;
        let meta = build_meta(conversation, &artifact, version);
        slot.versions.push(Artifact {
            meta: meta.clone(),
            data: artifact.data,
        });

        debug!(conversation = %conversation, artifact = %meta.name, version, "Artifact stored in memory");
        Ok(meta)
    }

    async fn get(
        &self,
        conversation: &ConversationId,
        name: &str,
        version: Option<u32>,
    ) -> Result<Artifact, StoreError> {
        let key = (conversation.clone(), name.to_string());
        let slot = self
            .slots
            .get(&key)
            .ok_or_else(|| not_found(conversation, name, version))?;
        let found = match version {
            Some(v) => slot.versions.get(v as usize),
            None => slot.versions.last(),
        };
        found
            .cloned()
            .ok_or_else(|| not_found(conversation, name, version))
    }

    async fn list(&self, conversation: &ConversationId) -> Result<Vec<ArtifactSummary>, StoreError> {
        let mut entries: Vec<(u64, ArtifactSummary)> = self
            .slots
            .iter()
            .filter(|entry| &entry.key().0 == conversation)
            .filter_map(|entry| {
                let slot = entry.value();
                let latest = slot.versions.last()?;
                Some((
                    slot.first_seen,
                    ArtifactSummary {
                        name: latest.meta.name.clone(),
                        latest_version: latest.meta.version,
                        media_kind: latest.meta.media_kind,
                        produced_by: latest.meta.produced_by.clone(),
                    },
                ))
            })
            .collect();
        entries.sort_by_key(|(seen, _)| *seen);
        Ok(entries.into_iter().map(|(_, summary)| summary).collect())
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        name: &str,
    ) -> Result<Vec<ArtifactMeta>, StoreError> {
        let key = (conversation.clone(), name.to_string());
        let slot = self
            .slots
            .get(&key)
            .ok_or_else(|| not_found(conversation, name, None))?;
        Ok(slot.versions.iter().map(|a| a.meta.clone()).collect())
    }

    async fn delete_conversation(&self, conversation: &ConversationId) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.slots.retain(|(owner, _), slot| {
            if owner == conversation {
                removed += slot.versions.len() as u64;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
