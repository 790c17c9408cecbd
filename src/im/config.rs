//! 存储核心配置

use std::path::PathBuf;
use std::time::Duration;

/// 用户资料同步策略
#[derive(Clone, Debug)]
pub struct SyncPolicy {
    /// 距上次同步超过该时长则必须重新同步
    pub stale_after: Duration,
    /// 尚未收到过资料时，两次尝试之间的最小间隔
    pub empty_profile_retry: Duration,
    /// 单次批量请求的最大用户数
    pub max_batch: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 60 * 60),
            empty_profile_retry: Duration::from_secs(2 * 60),
            max_batch: 100,
        }
    }
}

/// 存储核心配置
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// 数据根目录，每个会话用户在其下拥有独立子目录
    pub data_dir: PathBuf,
    /// 进程标识，同一数据目录被多个进程使用时用于隔离文件
    pub process_tag: String,
    /// 每个数据库文件的连接池上限
    pub max_connections: u32,
    /// SQLite busy 超时
    pub busy_timeout: Duration,
    /// 会话缓存容量（按 ID 和按目标用户各占一项）
    pub conversation_cache_capacity: usize,
    /// 用户资料缓存容量
    pub user_info_cache_capacity: usize,
    /// 总未读数缓存容量（每个会话用户一项）
    pub unread_cache_capacity: usize,
    /// 是否派发变更通知
    pub notify_enabled: bool,
    /// 恢复待发送集合时每页读取的条数
    pub resume_page_size: u32,
    /// 资料同步策略
    pub sync_policy: SyncPolicy,
}

impl StoreConfig {
    /// 创建默认配置
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            process_tag: "main".to_string(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            conversation_cache_capacity: 256,
            user_info_cache_capacity: 512,
            unread_cache_capacity: 16,
            notify_enabled: true,
            resume_page_size: 200,
            sync_policy: SyncPolicy::default(),
        }
    }

    pub fn with_process_tag(mut self, tag: impl Into<String>) -> Self {
        self.process_tag = tag.into();
        self
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_conversation_cache_capacity(mut self, n: usize) -> Self {
        self.conversation_cache_capacity = n;
        self
    }

    pub fn with_user_info_cache_capacity(mut self, n: usize) -> Self {
        self.user_info_cache_capacity = n;
        self
    }

    pub fn with_unread_cache_capacity(mut self, n: usize) -> Self {
        self.unread_cache_capacity = n;
        self
    }

    pub fn with_notify_enabled(mut self, enabled: bool) -> Self {
        self.notify_enabled = enabled;
        self
    }

    pub fn with_resume_page_size(mut self, n: u32) -> Self {
        self.resume_page_size = n.max(1);
        self
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// 会话用户的数据目录：`<data_dir>/<process_tag>/u<uid>`
    pub fn session_dir(&self, session_user_id: i64) -> PathBuf {
        self.data_dir
            .join(&self.process_tag)
            .join(format!("u{}", session_user_id))
    }
}
