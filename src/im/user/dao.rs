//! 用户资料数据访问层（user.db）

use crate::im::error::Result;
use crate::im::user::models::{UserInfo, UserInfoSync, UserProfile};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

/// 单条 IN 查询的最大参数个数
const BATCH_CHUNK: usize = 500;

pub struct UserInfoDao;

impl UserInfoDao {
    pub async fn get(conn: &mut SqliteConnection, uid: i64) -> Result<Option<UserInfo>> {
        let row = sqlx::query(
            "SELECT uid, update_time_ms, local_last_modify_ms, payload FROM user_info WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(Self::row_to_user_info).transpose()
    }

    /// 批量读取，结果顺序不保证
    pub async fn get_batch(conn: &mut SqliteConnection, uids: &[i64]) -> Result<Vec<UserInfo>> {
        let mut out = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(BATCH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT uid, update_time_ms, local_last_modify_ms, payload FROM user_info WHERE uid IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for uid in chunk {
                query = query.bind(*uid);
            }
            let rows = query.fetch_all(&mut *conn).await?;
            for row in &rows {
                out.push(Self::row_to_user_info(row)?);
            }
        }
        Ok(out)
    }

    /// 仅当新记录的服务端版本严格更新时写入，返回受影响行数（0 表示被忽略）
    pub async fn upsert_if_newer(conn: &mut SqliteConnection, info: &UserInfo) -> Result<u64> {
        let payload = serde_json::to_string(&info.profile)?;
        let res = sqlx::query(
            r#"
            INSERT INTO user_info (uid, update_time_ms, local_last_modify_ms, payload)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
                update_time_ms = excluded.update_time_ms,
                local_last_modify_ms = excluded.local_last_modify_ms,
                payload = excluded.payload
            WHERE excluded.update_time_ms > user_info.update_time_ms
            "#,
        )
        .bind(info.uid)
        .bind(info.update_time_ms)
        .bind(info.local_last_modify_ms)
        .bind(payload)
        .execute(&mut *conn)
        .await?;
        Ok(res.rows_affected())
    }

    /// 不存在时插入占位行，返回是否插入
    pub async fn touch(conn: &mut SqliteConnection, uid: i64, modify_ms: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT OR IGNORE INTO user_info (uid, update_time_ms, local_last_modify_ms, payload)
            VALUES (?, 0, ?, '{}')
            "#,
        )
        .bind(uid)
        .bind(modify_ms)
        .execute(&mut *conn)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    fn row_to_user_info(row: &SqliteRow) -> Result<UserInfo> {
        let payload: String = row.try_get("payload")?;
        let profile: UserProfile = serde_json::from_str(&payload)?;
        Ok(UserInfo {
            uid: row.try_get("uid")?,
            update_time_ms: row.try_get("update_time_ms")?,
            local_last_modify_ms: row.try_get("local_last_modify_ms")?,
            profile,
        })
    }
}

pub struct UserInfoSyncDao;

impl UserInfoSyncDao {
    pub async fn get(conn: &mut SqliteConnection, uid: i64) -> Result<Option<UserInfoSync>> {
        let row = sqlx::query("SELECT uid, local_last_sync_time_ms FROM user_info_sync WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_sync).transpose()
    }

    /// 记录一次同步尝试
    pub async fn record(conn: &mut SqliteConnection, uid: i64, sync_time_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_info_sync (uid, local_last_sync_time_ms) VALUES (?, ?)
            ON CONFLICT(uid) DO UPDATE SET local_last_sync_time_ms = excluded.local_last_sync_time_ms
            "#,
        )
        .bind(uid)
        .bind(sync_time_ms)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    fn row_to_sync(row: &SqliteRow) -> Result<UserInfoSync> {
        Ok(UserInfoSync {
            uid: row.try_get("uid")?,
            local_last_sync_time_ms: row.try_get("local_last_sync_time_ms")?,
        })
    }
}
