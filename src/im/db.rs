//! SQLite 数据库工具：统一创建连接池并执行 sqlx 迁移
//!
//! 约定：本 crate 根目录下存在 `migrations/im` 与 `migrations/user` 两组迁移，
//! 分别对应会话库（会话、待发送索引）和用户资料库。
//! 消息分表在运行时按会话动态创建，不在迁移中。

use crate::im::config::StoreConfig;
use crate::im::error::Result;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::info;

/// 会话库迁移
pub static IM_MIGRATOR: Migrator = sqlx::migrate!("./migrations/im");

/// 用户资料库迁移
pub static USER_MIGRATOR: Migrator = sqlx::migrate!("./migrations/user");

/// 创建 SQLite 连接池并执行所有未执行的迁移
pub async fn create_sqlite_pool_with_migration(
    path: &Path,
    config: &StoreConfig,
    migrator: &Migrator,
) -> Result<Pool<Sqlite>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(false)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(config.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    migrator.run(&pool).await?;
    info!("[DB] 数据库已就绪: {}", path.display());

    Ok(pool)
}
