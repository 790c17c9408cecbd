//! 待发送索引数据访问层

use crate::im::error::Result;
use crate::im::message::models::SendStatus;
use crate::im::sending::models::SendingEntry;
use crate::im::types::{ConversationKey, ConversationType};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const COLUMNS: &str =
    "local_id, conversation_type, target_user_id, message_local_id, local_send_status";

pub struct SendingDao;

impl SendingDao {
    pub async fn insert(conn: &mut SqliteConnection, entry: &SendingEntry) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO idle_sending_message (
                conversation_type,
                target_user_id,
                message_local_id,
                local_send_status
            ) VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(entry.conversation_type as i32)
        .bind(entry.target_user_id)
        .bind(entry.message_local_id)
        .bind(entry.local_send_status as i32)
        .execute(&mut *conn)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// 插入或刷新状态（同一条消息只有一项）
    pub async fn upsert(
        conn: &mut SqliteConnection,
        key: &ConversationKey,
        message_local_id: i64,
        status: SendStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idle_sending_message (
                conversation_type,
                target_user_id,
                message_local_id,
                local_send_status
            ) VALUES (?, ?, ?, ?)
            ON CONFLICT(conversation_type, target_user_id, message_local_id)
            DO UPDATE SET local_send_status = excluded.local_send_status
            "#,
        )
        .bind(key.conversation_type as i32)
        .bind(key.target_user_id)
        .bind(message_local_id)
        .bind(status as i32)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_by_id(conn: &mut SqliteConnection, local_id: i64) -> Result<Option<SendingEntry>> {
        let sql = format!("SELECT {} FROM idle_sending_message WHERE local_id = ?", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    pub async fn get_by_target_message(
        conn: &mut SqliteConnection,
        key: &ConversationKey,
        message_local_id: i64,
    ) -> Result<Option<SendingEntry>> {
        let sql = format!(
            r#"
            SELECT {} FROM idle_sending_message
            WHERE conversation_type = ? AND target_user_id = ? AND message_local_id = ?
            "#,
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.conversation_type as i32)
            .bind(key.target_user_id)
            .bind(message_local_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// 按 local_id 升序分页（最早的待发送项在前）
    pub async fn page_query(
        conn: &mut SqliteConnection,
        after_local_id: i64,
        fetch: i64,
    ) -> Result<Vec<SendingEntry>> {
        let sql = format!(
            "SELECT {} FROM idle_sending_message WHERE local_id > ? ORDER BY local_id ASC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(after_local_id)
            .bind(fetch)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    pub async fn remove(conn: &mut SqliteConnection, local_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM idle_sending_message WHERE local_id = ?")
            .bind(local_id)
            .execute(&mut *conn)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn remove_by_target_message(
        conn: &mut SqliteConnection,
        key: &ConversationKey,
        message_local_id: i64,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM idle_sending_message
            WHERE conversation_type = ? AND target_user_id = ? AND message_local_id = ?
            "#,
        )
        .bind(key.conversation_type as i32)
        .bind(key.target_user_id)
        .bind(message_local_id)
        .execute(&mut *conn)
        .await?;
        Ok(res.rows_affected())
    }

    fn row_to_entry(row: &SqliteRow) -> Result<SendingEntry> {
        Ok(SendingEntry {
            local_id: Some(row.try_get("local_id")?),
            conversation_type: ConversationType::try_from(row.try_get::<i32, _>("conversation_type")?)?,
            target_user_id: row.try_get("target_user_id")?,
            message_local_id: row.try_get("message_local_id")?,
            local_send_status: SendStatus::try_from(row.try_get::<i32, _>("local_send_status")?)?,
        })
    }
}
