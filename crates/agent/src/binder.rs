//! Per-conversation reference binding.
//!
//! A [`ContextBinder`] knows every artifact name seen in one conversation and
//! resolves tool-call references to concrete `(name, version)` pairs. Names
//! are only ever added; a conversation's binder is dropped when the
//! conversation is closed.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use proto::{
    ArtifactMeta, ArtifactRef, ArtifactSummary, ConversationId, InvocationError, StoreError,
};
use tracing::debug;

use crate::store::ArtifactStore;

/// Known artifacts of one conversation, in order of first appearance.
#[derive(Debug, Clone)]
pub struct ContextBinder {
    conversation_id: ConversationId,
    entries: Vec<ArtifactSummary>,
    index: HashMap<String, usize>,
}

impl ContextBinder {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Builds a binder from a store listing (used when resuming).
    pub fn from_summaries(conversation_id: ConversationId, summaries: Vec<ArtifactSummary>) -> Self {
        let mut binder = Self::new(conversation_id);
        for summary in summaries {
            binder.upsert(summary);
        }
        binder
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Records a freshly committed version.
    pub fn register(&mut self, meta: &ArtifactMeta) {
        self.upsert(ArtifactSummary {
            name: meta.name.clone(),
            latest_version: meta.version,
            media_kind: meta.media_kind,
            produced_by: meta.produced_by.clone(),
        });
        debug!(
            conversation = %self.conversation_id,
            artifact = %meta.name,
            version = meta.version,
            "Reference registered"
        );
    }

    fn upsert(&mut self, summary: ArtifactSummary) {
        match self.index.get(&summary.name) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                // Concurrent commits can land out of order.
                if summary.latest_version >= entry.latest_version {
                    *entry = summary;
                }
            }
            None => {
                self.index.insert(summary.name.clone(), self.entries.len());
                self.entries.push(summary);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self, name: &str) -> Option<&ArtifactSummary> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Resolves `name` (latest) or `name@vN` (pinned).
    ///
    /// Exact matches only: an unknown name, or a pin above the latest known
    /// version, is an `UnresolvedReference` naming the offending reference.
    pub fn resolve(&self, reference: &str) -> Result<ArtifactRef, InvocationError> {
        let reference = reference.trim();
        if let Some(entry) = self.latest(reference) {
            return Ok(ArtifactRef::new(entry.name.clone(), entry.latest_version));
        }

        let unresolved = || InvocationError::UnresolvedReference(reference.to_string());
        let (name, version) = ArtifactRef::split_pin(reference).map_err(|_| unresolved())?;
        let entry = self.latest(name).ok_or_else(unresolved)?;
        match version {
            Some(v) if v > entry.latest_version => Err(unresolved()),
            Some(v) => Ok(ArtifactRef::new(entry.name.clone(), v)),
            None => Ok(ArtifactRef::new(entry.name.clone(), entry.latest_version)),
        }
    }

    /// Ordered candidate list handed to the reasoning engine.
    pub fn candidates(&self) -> &[ArtifactSummary] {
        &self.entries
    }
}

pub type SharedBinder = Arc<RwLock<ContextBinder>>;

/// Open conversations and their binders.
#[derive(Default)]
pub struct ConversationRegistry {
    open: DashMap<ConversationId, SharedBinder>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binder for `conversation`, rehydrating it from the store
    /// on first use.
    pub async fn open(
        &self,
        conversation: &ConversationId,
        store: &dyn ArtifactStore,
    ) -> Result<SharedBinder, StoreError> {
        if let Some(binder) = self.open.get(conversation) {
            return Ok(binder.clone());
        }

        let summaries = store.list(conversation).await?;
        debug!(
            conversation = %conversation,
            artifacts = summaries.len(),
            "Conversation opened"
        );
        let fresh = Arc::new(RwLock::new(ContextBinder::from_summaries(
            conversation.clone(),
            summaries,
        )));
        // A racing opener may have inserted first; keep whichever landed.
        Ok(self
            .open
            .entry(conversation.clone())
            .or_insert(fresh)
            .clone())
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<SharedBinder> {
        self.open.get(conversation).map(|b| b.clone())
    }

    pub fn is_open(&self, conversation: &ConversationId) -> bool {
        self.open.contains_key(conversation)
    }

    /// Drops the binder. Returns `false` when the conversation was not open.
    pub fn close(&self, conversation: &ConversationId) -> bool {
        self.open.remove(conversation).is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proto::{MediaKind, NewArtifact};

    use super::*;
    use crate::store::MemoryArtifactStore;

    fn meta(name: &str, version: u32) -> ArtifactMeta {
        ArtifactMeta {
            conversation_id: ConversationId::from("c"),
            name: name.to_string(),
            version,
            media_kind: MediaKind::Image,
            mime_type: "image/png".to_string(),
            created_at: Utc::now(),
            produced_by: "upload".to_string(),
            inputs: Vec::new(),
            size_bytes: 1,
            sha256: String::new(),
        }
    }

    #[test]
    fn resolve_plain_name_returns_latest_version() {
        let mut binder = ContextBinder::new(ConversationId::from("c"));
        binder.register(&meta("soap.png", 0));
        binder.register(&meta("soap.png", 1));
        assert_eq!(
            binder.resolve("soap.png").expect("resolves"),
            ArtifactRef::new("soap.png", 1)
        );
    }

    #[test]
    fn resolve_pinned_version() {
        let mut binder = ContextBinder::new(ConversationId::from("c"));
        binder.register(&meta("soap.png", 2));
        assert_eq!(
            binder.resolve("soap.png@v0").expect("pinned"),
            ArtifactRef::new("soap.png", 0)
        );
        let err = binder.resolve("soap.png@v3").expect_err("future pin");
        assert!(matches!(err, InvocationError::UnresolvedReference(r) if r == "soap.png@v3"));
    }

    #[test]
    fn unknown_reference_is_never_guessed() {
        let mut binder = ContextBinder::new(ConversationId::from("c"));
        binder.register(&meta("candle1.png", 0));
        for reference in ["candle.png", "Candle1.png", "the second photo", "candle1"] {
            assert!(binder.resolve(reference).is_err(), "{reference} resolved");
        }
    }

    #[test]
    fn out_of_order_registration_keeps_highest_version() {
        let mut binder = ContextBinder::new(ConversationId::from("c"));
        binder.register(&meta("a.png", 2));
        binder.register(&meta("a.png", 1));
        assert_eq!(binder.latest("a.png").map(|s| s.latest_version), Some(2));
    }

    #[test]
    fn candidates_keep_first_appearance_order() {
        let mut binder = ContextBinder::new(ConversationId::from("c"));
        binder.register(&meta("candle1.png", 0));
        binder.register(&meta("candle2.png", 0));
        binder.register(&meta("candle1.png", 1));
        let names: Vec<&str> = binder.candidates().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["candle1.png", "candle2.png"]);
        assert_eq!(binder.candidates()[0].latest_version, 1);
    }

    #[tokio::test]
    async fn registry_rehydrates_from_store_and_closes() {
        let store = MemoryArtifactStore::new();
        let conv = ConversationId::from("resume-me");
        store
            .put(
                &conv,
                NewArtifact::upload("soap.png", b"x".to_vec(), MediaKind::Image, "image/png"),
            )
            .await
            .expect("put");

        let registry = ConversationRegistry::new();
        let binder = registry.open(&conv, &store).await.expect("open");
        assert!(binder.read().contains("soap.png"));
        assert!(registry.is_open(&conv));

        let again = registry.open(&conv, &store).await.expect("reopen");
        assert!(Arc::ptr_eq(&binder, &again));

        assert!(registry.close(&conv));
        assert!(!registry.close(&conv));
        assert!(registry.get(&conv).is_none());
    }
}
