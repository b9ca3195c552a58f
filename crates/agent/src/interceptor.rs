//! Pre-reasoning stage that moves attached media into the artifact store.

use std::sync::Arc;

use parking_lot::RwLock;
use proto::{
    ArtifactMeta, InboundTurn, MediaAttachment, MediaKind, NewArtifact, RejectedUpload, StoreError,
    TurnPart, UploadError, mime_extension,
};
use tracing::{info, warn};

use crate::binder::ContextBinder;
use crate::store::{ArtifactStore, sha256_hex};

/// Default per-item upload limit (20 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

const SYNTHETIC_DIGEST_LEN: usize = 12;

/// Result of intercepting one turn.
#[derive(Debug)]
pub struct InterceptedTurn {
    /// The turn with every raw media part replaced by a reference or a
    /// rejection note.
    pub turn: InboundTurn,
    pub stored: Vec<ArtifactMeta>,
    pub rejected: Vec<RejectedUpload>,
}

/// Stores each attached media item and rewrites the turn to reference it.
pub struct UploadInterceptor {
    store: Arc<dyn ArtifactStore>,
    max_bytes: u64,
}

impl UploadInterceptor {
    pub fn new(store: Arc<dyn ArtifactStore>, max_bytes: u64) -> Self {
        Self { store, max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Processes every media part of `turn` independently.
    ///
    /// A rejected item does not affect the others. Only a store failure
    /// aborts the stage.
    pub async fn intercept(
        &self,
        turn: InboundTurn,
        binder: &RwLock<ContextBinder>,
    ) -> Result<InterceptedTurn, StoreError> {
        let conversation = turn.conversation_id.clone();
        let mut parts = Vec::with_capacity(turn.parts.len());
        let mut stored = Vec::new();
        let mut rejected = Vec::new();

        for part in turn.parts {
            let TurnPart::Media(media) = part else {
                parts.push(part);
                continue;
            };

            let media_kind = match self.validate(&media) {
                Ok(kind) => kind,
                Err(UploadError::MediaRejected { item, reason }) => {
                    warn!(conversation = %conversation, item = %item, reason = %reason, "Upload rejected");
                    parts.push(TurnPart::Text(format!("[{item} was rejected: {reason}]")));
                    rejected.push(RejectedUpload { item, reason });
                    continue;
                }
            };

            let name = {
                let binder = binder.read();
                choose_name(&media, &|candidate| binder.contains(candidate))
            };
            let mime_type = media.declared_mime_type.trim().to_ascii_lowercase();
            let meta = self
                .store
                .put(
                    &conversation,
                    NewArtifact::upload(name, media.data, media_kind, mime_type),
                )
                .await?;
            binder.write().register(&meta);
            info!(
                conversation = %conversation,
                artifact = %meta.name,
                version = meta.version,
                bytes = meta.size_bytes,
                "Upload stored"
            );

            parts.push(TurnPart::Reference {
                name: meta.name.clone(),
                media_kind,
            });
            stored.push(meta);
        }

        Ok(InterceptedTurn {
            turn: InboundTurn {
                conversation_id: conversation,
                parts,
            },
            stored,
            rejected,
        })
    }

    fn validate(&self, media: &MediaAttachment) -> Result<MediaKind, UploadError> {
        let reject = |reason: String| UploadError::MediaRejected {
            item: media.label().to_string(),
            reason,
        };
        if media.data.is_empty() {
            return Err(reject("payload is empty or unreadable".to_string()));
        }
        if media.data.len() as u64 > self.max_bytes {
            return Err(reject(format!(
                "{} bytes exceeds the {} byte upload limit",
                media.data.len(),
                self.max_bytes
            )));
        }
        MediaKind::from_mime(&media.declared_mime_type).ok_or_else(|| {
            reject(format!(
                "unsupported media type '{}'",
                media.declared_mime_type
            ))
        })
    }
}

/// Picks a name for an upload: the cleaned original filename when it is free,
/// otherwise a content-derived `upload_<digest>.<ext>` name.
pub fn choose_name(media: &MediaAttachment, is_taken: &dyn Fn(&str) -> bool) -> String {
    if let Some(original) = media.filename.as_deref().map(sanitize_filename)
        && !original.is_empty()
        && !is_taken(&original)
    {
        return original;
    }

    let mut seed = media.filename.clone().unwrap_or_default().into_bytes();
    seed.extend_from_slice(&media.data);
    let digest = sha256_hex(&seed);
    let stem = format!("upload_{}", &digest[..SYNTHETIC_DIGEST_LEN]);
    let ext = mime_extension(&media.declared_mime_type).to_ascii_lowercase();

    let mut candidate = format!("{stem}.{ext}");
    let mut suffix = 2u32;
    while is_taken(&candidate) {
        candidate = format!("{stem}_{suffix}.{ext}");
        suffix += 1;
    }
    candidate
}

/// Keeps the last path component and replaces characters that would make a
/// poor identifier.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_matches('.').to_string()
}
