//! 消息数据访问层（DAO）
//!
//! 每个会话一张分表（`message_<type>_<target>`），表名由注册表生成，只含数字和下划线，
//! 因此可以直接拼进 SQL。

use crate::im::error::Result;
use crate::im::message::models::{LocalMessage, MediaMeta, MessageType, SendStatus};
use crate::im::types::{bool_col, SeqCursor};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

const COLUMNS: &str = r#"
    local_id,
    local_seq,
    from_user_id,
    to_user_id,
    remote_message_id,
    remote_message_time,
    local_time_ms,
    msg_type,
    title,
    body,
    thumb,
    local_title_origin,
    local_body_origin,
    local_thumb_origin,
    width,
    height,
    duration,
    lat,
    lng,
    zoom,
    local_send_status,
    local_action_message,
    local_block_id,
    local_last_modify_ms
"#;

/// 消息 DAO（基于 sqlx，按会话分表）
pub struct MessageDao;

impl MessageDao {
    /// 创建会话分表及索引（已存在则跳过）
    pub async fn create_partition(conn: &mut SqliteConnection, table: &str) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                local_id              INTEGER PRIMARY KEY AUTOINCREMENT,
                local_seq             INTEGER NOT NULL DEFAULT 0,
                from_user_id          INTEGER NOT NULL DEFAULT 0,
                to_user_id            INTEGER NOT NULL DEFAULT 0,
                remote_message_id     INTEGER,
                remote_message_time   INTEGER,
                local_time_ms         INTEGER NOT NULL DEFAULT 0,
                msg_type              INTEGER NOT NULL,
                title                 TEXT NOT NULL DEFAULT '',
                body                  TEXT NOT NULL DEFAULT '',
                thumb                 TEXT NOT NULL DEFAULT '',
                local_title_origin    TEXT NOT NULL DEFAULT '',
                local_body_origin     TEXT NOT NULL DEFAULT '',
                local_thumb_origin    TEXT NOT NULL DEFAULT '',
                width                 INTEGER NOT NULL DEFAULT 0,
                height                INTEGER NOT NULL DEFAULT 0,
                duration              INTEGER NOT NULL DEFAULT 0,
                lat                   REAL NOT NULL DEFAULT 0,
                lng                   REAL NOT NULL DEFAULT 0,
                zoom                  INTEGER NOT NULL DEFAULT 0,
                local_send_status     INTEGER NOT NULL DEFAULT 0,
                local_action_message  INTEGER NOT NULL DEFAULT 0,
                local_block_id        INTEGER NOT NULL DEFAULT 0,
                local_last_modify_ms  INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_seq ON {table}(local_seq);
            CREATE INDEX IF NOT EXISTS idx_{table}_from ON {table}(from_user_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_to ON {table}(to_user_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_remote_id ON {table}(remote_message_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_type ON {table}(msg_type);
            CREATE INDEX IF NOT EXISTS idx_{table}_send_status ON {table}(local_send_status);
            CREATE INDEX IF NOT EXISTS idx_{table}_block ON {table}(local_block_id);
            "#,
            table = table
        );
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql)).await?;
        Ok(())
    }

    /// 分表是否已存在（不建表）
    pub async fn partition_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    /// 插入消息，返回分表内新分配的 local_id
    pub async fn insert(conn: &mut SqliteConnection, table: &str, msg: &LocalMessage) -> Result<i64> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                local_seq,
                from_user_id,
                to_user_id,
                remote_message_id,
                remote_message_time,
                local_time_ms,
                msg_type,
                title,
                body,
                thumb,
                local_title_origin,
                local_body_origin,
                local_thumb_origin,
                width,
                height,
                duration,
                lat,
                lng,
                zoom,
                local_send_status,
                local_action_message,
                local_block_id,
                local_last_modify_ms
            ) VALUES (
                ?,?,?,?,?,?,?,?,
                ?,?,?,?,?,?,?,?,
                ?,?,?,?,?,?,?
            )
            "#,
            table
        );

        let res = sqlx::query(&sql)
            .bind(msg.local_seq)
            .bind(msg.from_user_id)
            .bind(msg.to_user_id)
            .bind(msg.remote_message_id)
            .bind(msg.remote_message_time)
            .bind(msg.local_time_ms)
            .bind(msg.message_type as i32)
            .bind(&msg.title)
            .bind(&msg.body)
            .bind(&msg.thumb)
            .bind(&msg.local_title_origin)
            .bind(&msg.local_body_origin)
            .bind(&msg.local_thumb_origin)
            .bind(msg.media.width)
            .bind(msg.media.height)
            .bind(msg.media.duration)
            .bind(msg.media.lat)
            .bind(msg.media.lng)
            .bind(msg.media.zoom)
            .bind(msg.local_send_status as i32)
            .bind(bool_col(msg.local_action_message))
            .bind(msg.local_block_id)
            .bind(msg.local_last_modify_ms)
            .execute(&mut *conn)
            .await?;

        Ok(res.last_insert_rowid())
    }

    /// 按 local_id 整体更新
    ///
    /// 服务端 ID 和时间一经写入不再改变：只有库里为空时才接受新值。
    pub async fn update(
        conn: &mut SqliteConnection,
        table: &str,
        local_id: i64,
        msg: &LocalMessage,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {} SET
                local_seq = ?,
                from_user_id = ?,
                to_user_id = ?,
                remote_message_id = COALESCE(remote_message_id, ?),
                remote_message_time = COALESCE(remote_message_time, ?),
                local_time_ms = ?,
                msg_type = ?,
                title = ?,
                body = ?,
                thumb = ?,
                local_title_origin = ?,
                local_body_origin = ?,
                local_thumb_origin = ?,
                width = ?,
                height = ?,
                duration = ?,
                lat = ?,
                lng = ?,
                zoom = ?,
                local_send_status = ?,
                local_action_message = ?,
                local_block_id = ?,
                local_last_modify_ms = ?
            WHERE local_id = ?
            "#,
            table
        );

        let res = sqlx::query(&sql)
            .bind(msg.local_seq)
            .bind(msg.from_user_id)
            .bind(msg.to_user_id)
            .bind(msg.remote_message_id)
            .bind(msg.remote_message_time)
            .bind(msg.local_time_ms)
            .bind(msg.message_type as i32)
            .bind(&msg.title)
            .bind(&msg.body)
            .bind(&msg.thumb)
            .bind(&msg.local_title_origin)
            .bind(&msg.local_body_origin)
            .bind(&msg.local_thumb_origin)
            .bind(msg.media.width)
            .bind(msg.media.height)
            .bind(msg.media.duration)
            .bind(msg.media.lat)
            .bind(msg.media.lng)
            .bind(msg.media.zoom)
            .bind(msg.local_send_status as i32)
            .bind(bool_col(msg.local_action_message))
            .bind(msg.local_block_id)
            .bind(msg.local_last_modify_ms)
            .bind(local_id)
            .execute(&mut *conn)
            .await?;

        Ok(res.rows_affected())
    }

    /// 只更新发送状态
    pub async fn update_send_status(
        conn: &mut SqliteConnection,
        table: &str,
        local_id: i64,
        status: SendStatus,
        modify_ms: i64,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET local_send_status = ?, local_last_modify_ms = ? WHERE local_id = ?",
            table
        );
        let res = sqlx::query(&sql)
            .bind(status as i32)
            .bind(modify_ms)
            .bind(local_id)
            .execute(&mut *conn)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        table: &str,
        local_id: i64,
    ) -> Result<Option<LocalMessage>> {
        let sql = format!("SELECT {} FROM {} WHERE local_id = ?", COLUMNS, table);
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    pub async fn get_by_remote_id(
        conn: &mut SqliteConnection,
        table: &str,
        remote_message_id: i64,
    ) -> Result<Option<LocalMessage>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE remote_message_id = ? ORDER BY local_id ASC LIMIT 1",
            COLUMNS, table
        );
        let row = sqlx::query(&sql)
            .bind(remote_message_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    /// seq 不超过 `seq` 的最新一条消息（用于计算消息块）
    pub async fn latest_at_or_before(
        conn: &mut SqliteConnection,
        table: &str,
        seq: i64,
    ) -> Result<Option<LocalMessage>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE local_seq <= ? ORDER BY local_seq DESC, local_id DESC LIMIT 1",
            COLUMNS, table
        );
        let row = sqlx::query(&sql)
            .bind(seq)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    /// 按 seq 倒序分页，取 `fetch` 条（调用方传 limit+1）
    pub async fn page_query(
        conn: &mut SqliteConnection,
        table: &str,
        before: SeqCursor,
        fetch: i64,
    ) -> Result<Vec<LocalMessage>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE local_seq < ? OR (local_seq = ? AND local_id < ?) \
             ORDER BY local_seq DESC, local_id DESC LIMIT ?",
            COLUMNS, table
        );
        let rows = sqlx::query(&sql)
            .bind(before.seq)
            .bind(before.seq)
            .bind(before.local_id)
            .bind(fetch)
            .fetch_all(&mut *conn)
            .await?;

        let messages = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "[MsgDAO] 分页查询 {}，before={:?}, 返回 {} 条",
            table,
            before,
            messages.len()
        );
        Ok(messages)
    }

    fn row_to_message(row: &SqliteRow) -> Result<LocalMessage> {
        Ok(LocalMessage {
            local_id: Some(row.try_get("local_id")?),
            local_seq: row.try_get("local_seq")?,
            from_user_id: row.try_get("from_user_id")?,
            to_user_id: row.try_get("to_user_id")?,
            remote_message_id: row.try_get("remote_message_id")?,
            remote_message_time: row.try_get("remote_message_time")?,
            local_time_ms: row.try_get("local_time_ms")?,
            message_type: MessageType::try_from(row.try_get::<i32, _>("msg_type")?)?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            thumb: row.try_get("thumb")?,
            local_title_origin: row.try_get("local_title_origin")?,
            local_body_origin: row.try_get("local_body_origin")?,
            local_thumb_origin: row.try_get("local_thumb_origin")?,
            media: MediaMeta {
                width: row.try_get("width")?,
                height: row.try_get("height")?,
                duration: row.try_get("duration")?,
                lat: row.try_get("lat")?,
                lng: row.try_get("lng")?,
                zoom: row.try_get("zoom")?,
            },
            local_send_status: SendStatus::try_from(row.try_get::<i32, _>("local_send_status")?)?,
            local_action_message: row.try_get::<i64, _>("local_action_message")? != 0,
            local_block_id: row.try_get("local_block_id")?,
            local_last_modify_ms: row.try_get("local_last_modify_ms")?,
        })
    }
}
