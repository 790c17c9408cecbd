//! 存储层错误定义
//!
//! 所有对外操作统一返回 [`Result`]，调用方可以区分"未找到"（`Ok(None)`）与"存储失败"（`Err`）。

use thiserror::Error;

/// 存储层结果类型
pub type Result<T> = std::result::Result<T, StoreError>;

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 调用方传入非法参数（缺少必填字段、重复分配 ID 等）
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 唯一键冲突
    #[error("唯一键冲突: {0}")]
    Duplicate(String),

    /// SQLite / sqlx 错误
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 迁移失败
    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// 序列化失败
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 文件系统错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 队列任务异常退出
    #[error("任务执行失败: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }

    /// 是否为调用方错误（而非存储故障）
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, StoreError::InvalidArgument(_) | StoreError::Duplicate(_))
    }

    /// 将唯一键冲突从数据库错误中区分出来
    pub(crate) fn from_write(err: sqlx::Error, what: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(format!("{}: {}", what, db.message()))
            }
            _ => StoreError::Database(err),
        }
    }

    /// 写入路径上的错误归类（唯一键冲突 -> `Duplicate`）
    pub(crate) fn for_write(self, what: &str) -> Self {
        match self {
            StoreError::Database(err) => StoreError::from_write(err, what),
            other => other,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}
