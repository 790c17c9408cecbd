//! 会话数据访问层（DAO）
//!
//! 负责所有会话相关的数据库操作，将数据访问逻辑与业务逻辑分离。
//! 所有方法接收 `&mut SqliteConnection`，既可以在写事务中调用，也可以用连接池里借出的连接读。

use crate::im::conversation::models::{ConversationFlags, LocalConversation};
use crate::im::error::Result;
use crate::im::types::{bool_col, ConversationKey, ConversationType, SeqCursor};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

const COLUMNS: &str = r#"
    local_id,
    local_seq,
    conversation_type,
    target_user_id,
    remote_message_start,
    remote_message_end,
    remote_message_last_read,
    remote_show_message_id,
    local_show_message_id,
    remote_unread,
    local_unread_count,
    local_time_ms,
    local_delete,
    local_last_modify_ms,
    matched,
    new_message,
    my_move,
    ice_break,
    tip_free,
    top_album,
    i_block_u,
    connected
"#;

/// 会话 DAO（基于 sqlx）
pub struct ConversationDao;

impl ConversationDao {
    /// 插入会话，返回新分配的 local_id
    pub async fn insert(conn: &mut SqliteConnection, conv: &LocalConversation) -> Result<i64> {
        let sql = r#"
            INSERT INTO conversation (
                local_seq,
                conversation_type,
                target_user_id,
                remote_message_start,
                remote_message_end,
                remote_message_last_read,
                remote_show_message_id,
                local_show_message_id,
                remote_unread,
                local_unread_count,
                local_time_ms,
                local_delete,
                local_last_modify_ms,
                matched,
                new_message,
                my_move,
                ice_break,
                tip_free,
                top_album,
                i_block_u,
                connected
            ) VALUES (
                ?,?,?,?,?,?,?,
                ?,?,?,?,?,?,?,
                ?,?,?,?,?,?,?
            )
        "#;

        let f = &conv.flags;
        let res = sqlx::query(sql)
            .bind(conv.local_seq)
            .bind(conv.conversation_type as i32)
            .bind(conv.target_user_id)
            .bind(conv.remote_message_start)
            .bind(conv.remote_message_end)
            .bind(conv.remote_message_last_read)
            .bind(conv.remote_show_message_id)
            .bind(conv.local_show_message_id)
            .bind(conv.remote_unread)
            .bind(conv.local_unread_count)
            .bind(conv.local_time_ms)
            .bind(bool_col(conv.local_delete))
            .bind(conv.local_last_modify_ms)
            .bind(bool_col(f.matched))
            .bind(bool_col(f.new_message))
            .bind(bool_col(f.my_move))
            .bind(bool_col(f.ice_break))
            .bind(bool_col(f.tip_free))
            .bind(bool_col(f.top_album))
            .bind(bool_col(f.i_block_u))
            .bind(bool_col(f.connected))
            .execute(&mut *conn)
            .await?;

        Ok(res.last_insert_rowid())
    }

    /// 按 local_id 更新可变字段（会话类型与对端用户不可变），返回受影响行数
    pub async fn update(conn: &mut SqliteConnection, local_id: i64, conv: &LocalConversation) -> Result<u64> {
        let sql = r#"
            UPDATE conversation SET
                local_seq = ?,
                remote_message_start = ?,
                remote_message_end = ?,
                remote_message_last_read = ?,
                remote_show_message_id = ?,
                local_show_message_id = ?,
                remote_unread = ?,
                local_unread_count = ?,
                local_time_ms = ?,
                local_delete = ?,
                local_last_modify_ms = ?,
                matched = ?,
                new_message = ?,
                my_move = ?,
                ice_break = ?,
                tip_free = ?,
                top_album = ?,
                i_block_u = ?,
                connected = ?
            WHERE local_id = ?
        "#;

        let f = &conv.flags;
        let res = sqlx::query(sql)
            .bind(conv.local_seq)
            .bind(conv.remote_message_start)
            .bind(conv.remote_message_end)
            .bind(conv.remote_message_last_read)
            .bind(conv.remote_show_message_id)
            .bind(conv.local_show_message_id)
            .bind(conv.remote_unread)
            .bind(conv.local_unread_count)
            .bind(conv.local_time_ms)
            .bind(bool_col(conv.local_delete))
            .bind(conv.local_last_modify_ms)
            .bind(bool_col(f.matched))
            .bind(bool_col(f.new_message))
            .bind(bool_col(f.my_move))
            .bind(bool_col(f.ice_break))
            .bind(bool_col(f.tip_free))
            .bind(bool_col(f.top_album))
            .bind(bool_col(f.i_block_u))
            .bind(bool_col(f.connected))
            .bind(local_id)
            .execute(&mut *conn)
            .await?;

        Ok(res.rows_affected())
    }

    /// 根据 local_id 查询单个会话
    pub async fn get_by_id(conn: &mut SqliteConnection, local_id: i64) -> Result<Option<LocalConversation>> {
        let sql = format!("SELECT {} FROM conversation WHERE local_id = ?", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    /// 根据 (会话类型, 对端用户) 查询单个会话
    pub async fn get_by_target(
        conn: &mut SqliteConnection,
        key: &ConversationKey,
    ) -> Result<Option<LocalConversation>> {
        let sql = format!(
            "SELECT {} FROM conversation WHERE conversation_type = ? AND target_user_id = ?",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.conversation_type as i32)
            .bind(key.target_user_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    /// 按 (seq, local_id) 倒序分页，取 `fetch` 条（调用方传 limit+1）
    pub async fn page_query(
        conn: &mut SqliteConnection,
        conversation_type: Option<ConversationType>,
        before: SeqCursor,
        fetch: i64,
        include_deleted: bool,
    ) -> Result<Vec<LocalConversation>> {
        let mut clauses = vec!["(local_seq < ? OR (local_seq = ? AND local_id < ?))"];
        if conversation_type.is_some() {
            clauses.push("conversation_type = ?");
        }
        if !include_deleted {
            clauses.push("local_delete = 0");
        }
        let sql = format!(
            "SELECT {} FROM conversation WHERE {} ORDER BY local_seq DESC, local_id DESC LIMIT ?",
            COLUMNS,
            clauses.join(" AND ")
        );

        let mut query = sqlx::query(&sql)
            .bind(before.seq)
            .bind(before.seq)
            .bind(before.local_id);
        if let Some(t) = conversation_type {
            query = query.bind(t as i32);
        }
        let rows = query.bind(fetch).fetch_all(&mut *conn).await?;

        let conversations = rows
            .iter()
            .map(Self::row_to_conversation)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "[ConvDAO] 分页查询会话，before={:?}, 返回 {} 条",
            before,
            conversations.len()
        );
        Ok(conversations)
    }

    /// 未删除会话的未读数之和
    pub async fn sum_unread(conn: &mut SqliteConnection) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(local_unread_count) FROM conversation WHERE local_delete = 0
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;
        Ok(total.unwrap_or(0))
    }

    fn row_to_conversation(row: &SqliteRow) -> Result<LocalConversation> {
        let flag = |name: &str| -> Result<bool> { Ok(row.try_get::<i64, _>(name)? != 0) };

        Ok(LocalConversation {
            local_id: Some(row.try_get("local_id")?),
            local_seq: row.try_get("local_seq")?,
            conversation_type: ConversationType::try_from(row.try_get::<i32, _>("conversation_type")?)?,
            target_user_id: row.try_get("target_user_id")?,
            remote_message_start: row.try_get("remote_message_start")?,
            remote_message_end: row.try_get("remote_message_end")?,
            remote_message_last_read: row.try_get("remote_message_last_read")?,
            remote_show_message_id: row.try_get("remote_show_message_id")?,
            local_show_message_id: row.try_get("local_show_message_id")?,
            remote_unread: row.try_get("remote_unread")?,
            local_unread_count: row.try_get("local_unread_count")?,
            local_time_ms: row.try_get("local_time_ms")?,
            local_delete: flag("local_delete")?,
            local_last_modify_ms: row.try_get("local_last_modify_ms")?,
            flags: ConversationFlags {
                matched: flag("matched")?,
                new_message: flag("new_message")?,
                my_move: flag("my_move")?,
                ice_break: flag("ice_break")?,
                tip_free: flag("tip_free")?,
                top_album: flag("top_album")?,
                i_block_u: flag("i_block_u")?,
                connected: flag("connected")?,
            },
        })
    }
}
