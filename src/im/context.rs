//! 存储上下文
//!
//! 启动时构造一次，持有注册表、写队列、通知总线和全部存储服务。
//! 同一进程可以同时存在多个互不相干的上下文。

use crate::im::clock::{Clock, SystemClock};
use crate::im::config::StoreConfig;
use crate::im::conversation::service::ConversationStore;
use crate::im::message::service::MessageStore;
use crate::im::notify::NotifyBus;
use crate::im::queue::WriteQueue;
use crate::im::registry::StoreRegistry;
use crate::im::sending::service::SendingQueue;
use crate::im::user::service::UserInfoStore;
use crate::im::user::sync::UserInfoSyncer;
use std::sync::Arc;
use tracing::info;

/// 各存储服务共享的依赖
#[derive(Clone)]
pub(crate) struct StoreDeps {
    pub registry: Arc<StoreRegistry>,
    pub writer: Arc<WriteQueue>,
    pub bus: Arc<NotifyBus>,
    pub clock: Arc<dyn Clock>,
}

/// 存储上下文
pub struct StoreContext {
    deps: StoreDeps,
    conversations: ConversationStore,
    messages: MessageStore,
    sending: SendingQueue,
    users: Arc<UserInfoStore>,
    user_sync: UserInfoSyncer,
}

impl StoreContext {
    /// 使用系统时钟创建上下文（必须在 tokio 运行时内调用）
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            "[Registry] 创建存储上下文: data_dir={}, process_tag={}",
            config.data_dir.display(),
            config.process_tag
        );
        let config = Arc::new(config);
        let deps = StoreDeps {
            registry: Arc::new(StoreRegistry::new(config.clone())),
            writer: Arc::new(WriteQueue::new()),
            bus: Arc::new(NotifyBus::new(config.notify_enabled)),
            clock,
        };

        let users = Arc::new(UserInfoStore::new(deps.clone(), config.user_info_cache_capacity));
        Self {
            conversations: ConversationStore::new(
                deps.clone(),
                config.conversation_cache_capacity,
                config.unread_cache_capacity,
            ),
            messages: MessageStore::new(deps.clone()),
            sending: SendingQueue::new(deps.clone(), config.resume_page_size),
            user_sync: UserInfoSyncer::new(deps.clone(), users.clone(), config.sync_policy.clone()),
            users,
            deps,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn sending(&self) -> &SendingQueue {
        &self.sending
    }

    pub fn users(&self) -> &UserInfoStore {
        &self.users
    }

    pub fn user_sync(&self) -> &UserInfoSyncer {
        &self.user_sync
    }

    pub fn bus(&self) -> &NotifyBus {
        &self.deps.bus
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.deps.registry
    }

    /// 关闭某个会话用户：关闭数据库并清理其缓存和队列
    pub async fn close(&self, session_user_id: i64) {
        let keys = self.deps.registry.close(session_user_id).await;
        for key in &keys {
            self.deps.writer.forget(key);
        }
        self.conversations.evict_session(session_user_id);
        self.users.evict_session(session_user_id);
        self.user_sync.forget(session_user_id);
    }

    /// 关闭全部会话用户
    pub async fn close_all(&self) {
        let sessions = self.deps.registry.open_sessions();
        let keys = self.deps.registry.close_all().await;
        for key in &keys {
            self.deps.writer.forget(key);
        }
        for session_user_id in sessions {
            self.conversations.evict_session(session_user_id);
            self.users.evict_session(session_user_id);
            self.user_sync.forget(session_user_id);
        }
    }
}
