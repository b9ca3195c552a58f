use chrono::{DateTime, Utc};
use proto::{AgentMessage, ConversationId, DatabaseError, Role};
use sqlx::{Row, sqlite::SqlitePool};
use std::str::FromStr;
use tracing::debug;

/// One row of the conversation listing.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

/// SQLite-backed conversation transcript
pub struct TurnLog {
    pool: SqlitePool,
}

fn sqlx_err(e: sqlx::Error) -> DatabaseError {
    DatabaseError::Sqlx(e.to_string())
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl TurnLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensure a conversation row exists (create if not)
    pub async fn ensure_conversation(&self, id: &ConversationId) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, title, created_at, updated_at) VALUES (?, '', ?, ?)",
        )
        .bind(id.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    /// Appends a message; ordering follows insertion, not timestamps.
    pub async fn save_message(&self, msg: &AgentMessage) -> Result<(), DatabaseError> {
        let tool_calls_json = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO messages (id, conversation_id, seq, role, content, tool_call_id, tool_name, tool_calls_json, created_at)
               SELECT ?, ?, COALESCE(MAX(seq), -1) + 1, ?, ?, ?, ?, ?, ?
               FROM messages WHERE conversation_id = ?"#,
        )
        .bind(&msg.id)
        .bind(msg.conversation_id.as_str())
        .bind(msg.role.to_string())
        .bind(&msg.content)
        .bind(&msg.tool_call_id)
        .bind(&msg.tool_name)
        .bind(tool_calls_json)
        .bind(msg.created_at.to_rfc3339())
        .bind(msg.conversation_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        // First user line becomes the title.
        if msg.role == Role::User {
            let title: String = msg.content.lines().next().unwrap_or_default().chars().take(80).collect();
            sqlx::query(
                "UPDATE conversations SET title = ?, updated_at = ? WHERE id = ? AND title = ''",
            )
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(msg.conversation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        }

        debug!(conversation = %msg.conversation_id, role = %msg.role, "Saved message {}", msg.id);
        Ok(())
    }

    /// Load all messages for a conversation in insertion order
    pub async fn load_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<AgentMessage>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT id, role, content, tool_call_id, tool_name, tool_calls_json, created_at FROM messages WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.into_iter()
            .map(|row| {
                let role_str: String = row.get("role");
                let role = Role::from_str(&role_str)
                    .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
                let tool_calls_json: Option<String> = row.get("tool_calls_json");
                let tool_calls = tool_calls_json
                    .map(|json| serde_json::from_str(&json))
                    .transpose()
                    .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
                let created_at: String = row.get("created_at");
                Ok(AgentMessage {
                    id: row.get("id"),
                    conversation_id: id.clone(),
                    role,
                    content: row.get("content"),
                    tool_call_id: row.get("tool_call_id"),
                    tool_name: row.get("tool_name"),
                    tool_calls,
                    created_at: parse_time(&created_at),
                })
            })
            .collect()
    }

    /// All conversations, most recently active first
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, DatabaseError> {
        let rows = sqlx::query(
            r#"SELECT c.id, c.title, c.updated_at,
                      (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
               FROM conversations c
               ORDER BY c.updated_at DESC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let updated_at: String = row.get("updated_at");
                ConversationSummary {
                    id: ConversationId::from(row.get::<String, _>("id")),
                    title: row.get("title"),
                    updated_at: parse_time(&updated_at),
                    message_count: row.get("message_count"),
                }
            })
            .collect())
    }

    pub async fn touch_conversation(&self, id: &ConversationId) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    /// Removes the transcript. Returns `false` if the conversation was unknown.
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, DatabaseError> {
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn open_temp_log() -> (TurnLog, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("studio.db");
        let pool = db::open_pool(&path.to_string_lossy())
            .await
            .expect("pool should open");
        (TurnLog::new(pool), tmp)
    }

    #[tokio::test]
    async fn ensure_conversation_is_idempotent_and_listed() {
        let (log, _tmp) = open_temp_log().await;
        let id = ConversationId::from("conv-a");
        log.ensure_conversation(&id).await.expect("first");
        log.ensure_conversation(&id).await.expect("second");

        let listed = log.list_conversations().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].message_count, 0);
    }

    #[tokio::test]
    async fn save_and_load_messages_round_trip_in_order() {
        let (log, _tmp) = open_temp_log().await;
        let id = ConversationId::from("conv-b");
        log.ensure_conversation(&id).await.expect("ensure");

        let user = AgentMessage::new(id.clone(), Role::User, "add lavender\nsoap.png (image)");
        let assistant = AgentMessage::assistant_tool_calls(
            id.clone(),
            vec![proto::ToolCall {
                id: "call-1".to_string(),
                name: "edit".to_string(),
                arguments: serde_json::json!({"input_artifacts":["soap.png"],"instruction":"add lavender"}),
            }],
        );
        let tool = AgentMessage::tool_result(id.clone(), "call-1", "edit", r#"{"status":"success"}"#);
        let reply = AgentMessage::new(id.clone(), Role::Assistant, "Done.");
        for msg in [&user, &assistant, &tool, &reply] {
            log.save_message(msg).await.expect("save");
        }

        let loaded = log.load_conversation(&id).await.expect("load");
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[0].role, Role::User);
        assert_eq!(loaded[1].tool_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(loaded[2].tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(loaded[3].content, "Done.");

        let listed = log.list_conversations().await.expect("list");
        assert_eq!(listed[0].title, "add lavender");
        assert_eq!(listed[0].message_count, 4);
    }

    #[tokio::test]
    async fn delete_conversation_removes_transcript() {
        let (log, _tmp) = open_temp_log().await;
        let id = ConversationId::from("conv-c");
        log.ensure_conversation(&id).await.expect("ensure");
        log.save_message(&AgentMessage::new(id.clone(), Role::User, "hi"))
            .await
            .expect("save");
        log.touch_conversation(&id).await.expect("touch");

        assert!(log.delete_conversation(&id).await.expect("delete"));
        assert!(log.load_conversation(&id).await.expect("load").is_empty());
        assert!(!log.delete_conversation(&id).await.expect("second delete"));
    }
}
