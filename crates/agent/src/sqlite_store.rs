use std::str::FromStr;

use async_trait::async_trait;
use proto::{
    Artifact, ArtifactMeta, ArtifactRef, ArtifactSummary, ConversationId, MediaKind, NewArtifact,
    StoreError,
};
use sqlx::{Row, sqlite::SqlitePool, sqlite::SqliteRow};
use tracing::{debug, warn};

use crate::store::{ArtifactStore, build_meta, not_found};

const META_COLUMNS: &str =
    "name, version, media_kind, mime_type, produced_by, inputs_json, size_bytes, sha256, created_at";

/// SQLite-backed artifact store.
///
/// Versions are allocated inside the INSERT itself, under the
/// `(conversation_id, name, version)` primary key, so concurrent writers to
/// one name are serialized by SQLite's writer lock.
pub struct SqliteArtifactStore {
    pool: SqlitePool,
}

impl SqliteArtifactStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn meta_from_row(conversation: &ConversationId, row: &SqliteRow) -> Result<ArtifactMeta, StoreError> {
    let name: String = row.try_get("name").map_err(storage)?;
    let corrupt = |what: &str, detail: String| {
        StoreError::Corrupt(format!("{name}: bad {what}: {detail}"))
    };

    let version: i64 = row.try_get("version").map_err(storage)?;
    let version = u32::try_from(version).map_err(|e| corrupt("version", e.to_string()))?;
    let media_kind: String = row.try_get("media_kind").map_err(storage)?;
    let media_kind =
        MediaKind::from_str(&media_kind).map_err(|e| corrupt("media kind", e.to_string()))?;
    let inputs_json: String = row.try_get("inputs_json").map_err(storage)?;
    let inputs: Vec<ArtifactRef> =
        serde_json::from_str(&inputs_json).map_err(|e| corrupt("lineage", e.to_string()))?;
    let size_bytes: i64 = row.try_get("size_bytes").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| corrupt("timestamp", e.to_string()))?;

    Ok(ArtifactMeta {
        conversation_id: conversation.clone(),
        version,
        media_kind,
        mime_type: row.try_get("mime_type").map_err(storage)?,
        created_at,
        produced_by: row.try_get("produced_by").map_err(storage)?,
        inputs,
        size_bytes: u64::try_from(size_bytes).map_err(|e| corrupt("size", e.to_string()))?,
        sha256: row.try_get("sha256").map_err(storage)?,
        name,
    })
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn put(
        &self,
        conversation: &ConversationId,
        artifact: NewArtifact,
    ) -> Result<ArtifactMeta, StoreError> {
        let inputs_json = serde_json::to_string(&artifact.inputs)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        // Allocation and insert are one statement: SQLite takes the write lock
        // before evaluating the SELECT, so concurrent writers queue on the
        // busy handler instead of reading the same MAX(version).
        let provisional = build_meta(conversation, &artifact, 0);
        let next: i64 = sqlx::query_scalar(
            r#"INSERT INTO artifacts (conversation_id, name, version, media_kind, mime_type, produced_by, inputs_json, size_bytes, sha256, data, created_at)
               SELECT ?1, ?2, COALESCE(MAX(version), -1) + 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
               FROM artifacts WHERE conversation_id = ?1 AND name = ?2
               RETURNING version"#,
        )
        .bind(conversation.as_str())
        .bind(&provisional.name)
        .bind(provisional.media_kind.as_str())
        .bind(&provisional.mime_type)
        .bind(&provisional.produced_by)
        .bind(&inputs_json)
        .bind(provisional.size_bytes as i64)
        .bind(&provisional.sha256)
        .bind(&artifact.data)
        .bind(provisional.created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            warn!(conversation = %conversation, artifact = %artifact.name, error = %e, "Artifact write failed");
            storage(e)
        })?;

        let version = u32::try_from(next)
            .map_err(|_| StoreError::Corrupt(format!("{}: version out of range", artifact.name)))?;
        let meta = ArtifactMeta {
            version,
            ..provisional
        };
        debug!(conversation = %conversation, artifact = %meta.name, version, "Artifact stored");
        Ok(meta)
    }

    async fn get(
        &self,
        conversation: &ConversationId,
        name: &str,
        version: Option<u32>,
    ) -> Result<Artifact, StoreError> {
        let row = match version {
            Some(v) => {
                sqlx::query(&format!(
                    "SELECT {META_COLUMNS}, data FROM artifacts WHERE conversation_id = ? AND name = ? AND version = ?"
                ))
                .bind(conversation.as_str())
                .bind(name)
                .bind(i64::from(v))
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {META_COLUMNS}, data FROM artifacts WHERE conversation_id = ? AND name = ? ORDER BY version DESC LIMIT 1"
                ))
                .bind(conversation.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(storage)?
        .ok_or_else(|| not_found(conversation, name, version))?;

        let meta = meta_from_row(conversation, &row)?;
        let data: Vec<u8> = row.try_get("data").map_err(storage)?;
        if data.len() as u64 != meta.size_bytes {
            return Err(StoreError::Corrupt(format!(
                "{}: payload is {} bytes, metadata says {}",
                meta.artifact_ref(),
                data.len(),
                meta.size_bytes
            )));
        }
        Ok(Artifact { meta, data })
    }

    async fn list(&self, conversation: &ConversationId) -> Result<Vec<ArtifactSummary>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT a.name, a.version, a.media_kind, a.produced_by
               FROM artifacts a
               JOIN (
                   SELECT name, MAX(version) AS latest, MIN(rowid) AS first_row
                   FROM artifacts
                   WHERE conversation_id = ?
                   GROUP BY name
               ) l ON a.name = l.name AND a.version = l.latest
               WHERE a.conversation_id = ?
               ORDER BY l.first_row ASC"#,
        )
        .bind(conversation.as_str())
        .bind(conversation.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(storage)?;
                let version: i64 = row.try_get("version").map_err(storage)?;
                let media_kind: String = row.try_get("media_kind").map_err(storage)?;
                Ok(ArtifactSummary {
                    latest_version: u32::try_from(version)
                        .map_err(|e| StoreError::Corrupt(format!("{name}: {e}")))?,
                    media_kind: MediaKind::from_str(&media_kind)
                        .map_err(|e| StoreError::Corrupt(format!("{name}: {e}")))?,
                    produced_by: row.try_get("produced_by").map_err(storage)?,
                    name,
                })
            })
            .collect()
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        name: &str,
    ) -> Result<Vec<ArtifactMeta>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {META_COLUMNS} FROM artifacts WHERE conversation_id = ? AND name = ? ORDER BY version ASC"
        ))
        .bind(conversation.as_str())
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        if rows.is_empty() {
            return Err(not_found(conversation, name, None));
        }
        rows.iter().map(|row| meta_from_row(conversation, row)).collect()
    }

    async fn delete_conversation(&self, conversation: &ConversationId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM artifacts WHERE conversation_id = ?")
            .bind(conversation.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db;

    async fn open_temp_store() -> (SqliteArtifactStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("studio.db");
        let pool = db::open_pool(&path.to_string_lossy())
            .await
            .expect("pool should open");
        (SqliteArtifactStore::new(pool), tmp)
    }

    fn upload(name: &str, data: &[u8]) -> NewArtifact {
        NewArtifact::upload(name, data.to_vec(), MediaKind::Image, "image/png")
    }

    #[tokio::test]
    async fn put_get_round_trip_preserves_lineage() {
        let (store, _tmp) = open_temp_store().await;
        let conv = ConversationId::from("c1");
        store.put(&conv, upload("a.png", b"a")).await.expect("a");
        store.put(&conv, upload("b.png", b"b")).await.expect("b");

        let combined = NewArtifact {
            name: "combined.png".to_string(),
            data: b"ab".to_vec(),
            media_kind: MediaKind::Image,
            mime_type: "image/png".to_string(),
            produced_by: "combine".to_string(),
            inputs: vec![ArtifactRef::new("a.png", 0), ArtifactRef::new("b.png", 0)],
        };
        let meta = store.put(&conv, combined).await.expect("combined");

        let got = store
            .get(&conv, "combined.png", None)
            .await
            .expect("get latest");
        assert_eq!(got.data, b"ab");
        assert_eq!(got.meta.inputs, meta.inputs);
        assert_eq!(got.meta.produced_by, "combine");
        assert_eq!(got.meta.sha256, meta.sha256);
    }

    #[tokio::test]
    async fn list_returns_latest_versions_in_first_appearance_order() {
        let (store, _tmp) = open_temp_store().await;
        let conv = ConversationId::from("c1");
        store.put(&conv, upload("soap.png", b"0")).await.expect("put");
        store.put(&conv, upload("candle.png", b"0")).await.expect("put");
        store.put(&conv, upload("soap.png", b"1")).await.expect("put");

        let listed = store.list(&conv).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "soap.png");
        assert_eq!(listed[0].latest_version, 1);
        assert_eq!(listed[1].name, "candle.png");
        assert_eq!(listed[1].latest_version, 0);
    }

    #[tokio::test]
    async fn missing_reads_are_not_found() {
        let (store, _tmp) = open_temp_store().await;
        let conv = ConversationId::from("c1");
        store.put(&conv, upload("soap.png", b"0")).await.expect("put");

        assert!(matches!(
            store.get(&conv, "soap.png", Some(5)).await,
            Err(StoreError::NotFound { version: Some(5), .. })
        ));
        assert!(matches!(
            store.history(&conv, "nope.png").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_skip_or_reuse_versions() {
        let (store, _tmp) = open_temp_store().await;
        let store = Arc::new(store);
        let conv = ConversationId::from("c1");

        let mut handles = Vec::new();
        for i in 0..64u8 {
            let store = store.clone();
            let conv = conv.clone();
            handles.push(tokio::spawn(async move {
                store.put(&conv, upload("shared.png", &[i])).await
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            let meta = handle.await.expect("join").expect("every write must land");
            versions.push(meta.version);
        }
        versions.sort_unstable();
        let expected: Vec<u32> = (0..64).collect();
        assert_eq!(versions, expected);

        let history = store.history(&conv, "shared.png").await.expect("history");
        assert_eq!(history.len(), 64);
        let mut payloads: Vec<u8> = Vec::new();
        for meta in &history {
            let got = store
                .get(&conv, "shared.png", Some(meta.version))
                .await
                .expect("each version readable");
            payloads.push(got.data[0]);
        }
        payloads.sort_unstable();
        assert_eq!(payloads, (0..64u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn delete_conversation_removes_only_that_conversation() {
        let (store, _tmp) = open_temp_store().await;
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");
        store.put(&a, upload("x.png", b"1")).await.expect("put");
        store.put(&a, upload("x.png", b"2")).await.expect("put");
        store.put(&b, upload("x.png", b"3")).await.expect("put");

        assert_eq!(store.delete_conversation(&a).await.expect("delete"), 2);
        assert!(store.list(&a).await.expect("list").is_empty());
        assert_eq!(
            store.get(&b, "x.png", None).await.expect("b survives").data,
            b"3"
        );
    }
}
