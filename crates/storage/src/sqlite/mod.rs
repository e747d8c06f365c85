use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvalidIdListSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{BackgroundId, MessageId, SessionId, SummaryId};
use super::types::{
    BackgroundRecord, MessageRecord, MessageRole, NewBackground, NewMessage, NewSummary,
    SessionRecord, SummaryRecord,
};

/// Sqlite-backed store for the conversation tree, compaction summaries,
/// background versions, and the single session row. The store is the only
/// component that writes these tables.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps writes serialized and keeps
        // `sqlite::memory:` databases alive for their whole test run.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persists a message node. Blank content never reaches a row.
    pub async fn append_message(&self, input: NewMessage) -> StorageResult<MessageRecord> {
        if input.content.trim().is_empty() {
            return ConflictSnafu {
                stage: "message-append-blank-content",
                entity: "message",
                details: "message content must not be blank".to_string(),
            }
            .fail();
        }

        let message_id = MessageId::new_v7();
        let created_at = self.next_created_at("message-append-next-created-at").await?;

        sqlx::query(
            "INSERT INTO messages (id, role, content, parent_id, created_at, is_deleted) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(message_id.to_string())
        .bind(role_to_sql(input.role))
        .bind(input.content.clone())
        .bind(input.parent_id.map(|parent| parent.to_string()))
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-insert",
        })?;

        Ok(MessageRecord {
            id: message_id,
            role: input.role,
            content: input.content,
            parent_id: input.parent_id,
            created_at_unix_ms: created_at,
            is_deleted: false,
        })
    }

    pub async fn list_messages(&self, include_deleted: bool) -> StorageResult<Vec<MessageRecord>> {
        let rows = if include_deleted {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, role, content, parent_id, created_at, is_deleted FROM messages ORDER BY created_at ASC, id ASC",
            )
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, MessageRow>(
                "SELECT id, role, content, parent_id, created_at, is_deleted FROM messages WHERE is_deleted = 0 ORDER BY created_at ASC, id ASC",
            )
            .fetch_all(&self.pool)
            .await
        }
        .context(SqliteQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    /// Fetches a live message. Deleted nodes are invisible here, matching
    /// the resolver's exclusion filter.
    pub async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<MessageRecord>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, role, content, parent_id, created_at, is_deleted FROM messages WHERE id = ? AND is_deleted = 0",
        )
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-get-query",
        })?;

        row.map(message_row_to_record).transpose()
    }

    /// Flips the soft-delete flag for exactly the given ids, in one
    /// transaction. Rows already in the target state are left untouched;
    /// the returned count is the number of rows actually flipped.
    pub async fn set_messages_deleted(
        &self,
        message_ids: &[MessageId],
        deleted: bool,
    ) -> StorageResult<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-set-deleted-begin",
        })?;

        let target = i64::from(deleted);
        let mut flipped = 0_u64;
        for message_id in message_ids {
            let result =
                sqlx::query("UPDATE messages SET is_deleted = ? WHERE id = ? AND is_deleted = ?")
                    .bind(target)
                    .bind(message_id.to_string())
                    .bind(1 - target)
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-set-deleted-apply",
                    })?;
            flipped += result.rows_affected();
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-set-deleted-commit",
        })?;

        Ok(flipped)
    }

    pub async fn insert_summary(&self, input: NewSummary) -> StorageResult<SummaryRecord> {
        let summary_id = SummaryId::new_v7();
        let created_at = unix_timestamp_ms();
        let message_ids_json = encode_id_list(&input.message_ids);

        sqlx::query(
            "INSERT INTO conversation_summaries (id, summary_text, start_message_id, end_message_id, message_ids, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(summary_id.to_string())
        .bind(input.summary_text.clone())
        .bind(input.start_message_id.to_string())
        .bind(input.end_message_id.to_string())
        .bind(message_ids_json)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "summary-insert",
        })?;

        Ok(SummaryRecord {
            id: summary_id,
            summary_text: input.summary_text,
            start_message_id: input.start_message_id,
            end_message_id: input.end_message_id,
            message_ids: input.message_ids,
            created_at_unix_ms: created_at,
        })
    }

    pub async fn list_summaries(&self) -> StorageResult<Vec<SummaryRecord>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, summary_text, start_message_id, end_message_id, message_ids, created_at FROM conversation_summaries ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "summary-list-query",
        })?;

        rows.into_iter().map(summary_row_to_record).collect()
    }

    /// Appends a new background version. The version counter is assigned
    /// here so it stays monotonic no matter who asks for a refresh.
    pub async fn insert_background(&self, input: NewBackground) -> StorageResult<BackgroundRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "background-insert-begin",
        })?;

        let latest_version = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(version), 0) FROM backgrounds",
        )
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "background-insert-latest-version",
        })?;

        let background_id = BackgroundId::new_v7();
        let updated_at = unix_timestamp_ms();
        let version = latest_version + 1;
        let source_ids_json = encode_id_list(&input.source_message_ids);

        sqlx::query(
            "INSERT INTO backgrounds (id, summary_text, source_message_ids, updated_at, version) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(background_id.to_string())
        .bind(input.summary_text.clone())
        .bind(source_ids_json)
        .bind(updated_at)
        .bind(version)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "background-insert-apply",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "background-insert-commit",
        })?;

        Ok(BackgroundRecord {
            id: background_id,
            summary_text: input.summary_text,
            source_message_ids: input.source_message_ids,
            updated_at_unix_ms: updated_at,
            version: i64_to_u32(version, "background-insert-version")?,
        })
    }

    pub async fn latest_background(&self) -> StorageResult<Option<BackgroundRecord>> {
        let row = sqlx::query_as::<_, BackgroundRow>(
            "SELECT id, summary_text, source_message_ids, updated_at, version FROM backgrounds ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "background-latest-query",
        })?;

        row.map(background_row_to_record).transpose()
    }

    /// Loads the device session, creating it on first use.
    pub async fn load_or_create_session(&self) -> StorageResult<SessionRecord> {
        let existing = sqlx::query_as::<_, SessionRow>(
            "SELECT id, current_message_id, created_at, updated_at FROM sessions ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-load-query",
        })?;

        if let Some(row) = existing {
            return session_row_to_record(row);
        }

        let session_id = SessionId::new_v7();
        let now = unix_timestamp_ms();
        sqlx::query(
            "INSERT INTO sessions (id, current_message_id, created_at, updated_at) VALUES (?, NULL, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-create-insert",
        })?;

        Ok(SessionRecord {
            id: session_id,
            current_message_id: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        })
    }

    pub async fn set_session_cursor(
        &self,
        session_id: SessionId,
        cursor: Option<MessageId>,
    ) -> StorageResult<()> {
        let now = unix_timestamp_ms();
        let result =
            sqlx::query("UPDATE sessions SET current_message_id = ?, updated_at = ? WHERE id = ?")
                .bind(cursor.map(|message_id| message_id.to_string()))
                .bind(now)
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-set-cursor-apply",
                })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "session-set-cursor-missing",
                entity: "session",
                id: session_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    // created_at is the sole ordering key within a branch; keep it strictly
    // increasing even when two inserts land in the same millisecond.
    async fn next_created_at(&self, stage: &'static str) -> StorageResult<i64> {
        let max_existing =
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(created_at), 0) FROM messages")
                .fetch_one(&self.pool)
                .await
                .context(SqliteQuerySnafu { stage })?;

        Ok(unix_timestamp_ms().max(max_existing + 1))
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    parent_id: Option<String>,
    created_at: i64,
    is_deleted: i64,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    id: String,
    summary_text: String,
    start_message_id: String,
    end_message_id: String,
    message_ids: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct BackgroundRow {
    id: String,
    summary_text: String,
    source_message_ids: String,
    updated_at: i64,
    version: i64,
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    current_message_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        parent_id: row.parent_id.as_deref().map(MessageId::parse).transpose()?,
        created_at_unix_ms: row.created_at,
        is_deleted: row.is_deleted != 0,
    })
}

fn summary_row_to_record(row: SummaryRow) -> StorageResult<SummaryRecord> {
    Ok(SummaryRecord {
        id: SummaryId::parse(&row.id)?,
        summary_text: row.summary_text,
        start_message_id: MessageId::parse(&row.start_message_id)?,
        end_message_id: MessageId::parse(&row.end_message_id)?,
        message_ids: decode_id_list(&row.message_ids, "summary-row-message-ids")?,
        created_at_unix_ms: row.created_at,
    })
}

fn background_row_to_record(row: BackgroundRow) -> StorageResult<BackgroundRecord> {
    Ok(BackgroundRecord {
        id: BackgroundId::parse(&row.id)?,
        summary_text: row.summary_text,
        source_message_ids: decode_id_list(&row.source_message_ids, "background-row-source-ids")?,
        updated_at_unix_ms: row.updated_at,
        version: i64_to_u32(row.version, "background-row-version")?,
    })
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        current_message_id: row
            .current_message_id
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
        created_at_unix_ms: row.created_at,
        updated_at_unix_ms: row.updated_at,
    })
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn encode_id_list(ids: &[MessageId]) -> String {
    let raw: Vec<String> = ids.iter().map(MessageId::to_string).collect();
    serde_json::to_string(&raw).unwrap_or_else(|_| "[]".to_string())
}

fn decode_id_list(raw: &str, stage: &'static str) -> StorageResult<Vec<MessageId>> {
    let parsed: Vec<String> = serde_json::from_str(raw).context(InvalidIdListSnafu {
        stage,
        raw: raw.to_string(),
    })?;

    parsed
        .iter()
        .map(|value| MessageId::parse(value))
        .collect()
}

fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
