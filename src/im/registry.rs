//! 存储注册表
//!
//! 每个（会话用户, 进程标识）对应一组数据库文件：
//! - `im.db`：会话、消息分表、待发送索引
//! - `user.db`：用户资料及同步记录
//!
//! 句柄首次访问时创建并执行迁移，之后复用。消息分表按会话懒创建并记忆。

use crate::im::config::StoreConfig;
use crate::im::db::{create_sqlite_pool_with_migration, IM_MIGRATOR, USER_MIGRATOR};
use crate::im::error::{Result, StoreError};
use crate::im::message::dao::MessageDao;
use crate::im::queue::WriteQueue;
use crate::im::types::ConversationKey;
use futures_util::future::join_all;
use parking_lot::Mutex;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// 数据库种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Im,
    User,
}

/// 数据库句柄的身份，写队列按它排队
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub process_tag: Arc<str>,
    pub session_user_id: i64,
    pub kind: StoreKind,
}

/// 单个数据库文件的句柄
#[derive(Clone)]
pub struct DbHandle {
    key: StoreKey,
    pool: Pool<Sqlite>,
}

impl DbHandle {
    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// 一个会话的消息分表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePartition {
    pub key: ConversationKey,
    pub table: String,
}

impl MessagePartition {
    /// 分表名：`message_<conversationType>_<targetUserId>`
    pub fn table_name(key: &ConversationKey) -> String {
        format!(
            "message_{}_{}",
            key.conversation_type as i32, key.target_user_id
        )
    }
}

type PartitionSlot = Arc<OnceCell<Arc<MessagePartition>>>;

/// 一个会话用户的全部存储
pub struct SessionStore {
    session_user_id: i64,
    im: DbHandle,
    user: DbHandle,
    partitions: Mutex<HashMap<ConversationKey, PartitionSlot>>,
}

impl SessionStore {
    pub fn session_user_id(&self) -> i64 {
        self.session_user_id
    }

    /// 会话库（会话、消息、待发送索引）
    pub fn im(&self) -> &DbHandle {
        &self.im
    }

    /// 用户资料库
    pub fn user(&self) -> &DbHandle {
        &self.user
    }

    /// 按需创建消息分表，首次创建后 O(1) 返回
    pub async fn create_message_partition_if_needed(
        &self,
        writer: &WriteQueue,
        key: ConversationKey,
    ) -> Result<Arc<MessagePartition>> {
        key.validate()?;
        let slot = {
            let mut partitions = self.partitions.lock();
            partitions.entry(key).or_default().clone()
        };

        let partition = slot
            .get_or_try_init(|| async {
                let table = MessagePartition::table_name(&key);
                let ddl_table = table.clone();
                writer
                    .execute_transaction(&self.im, move |conn| {
                        Box::pin(async move { MessageDao::create_partition(conn, &ddl_table).await })
                    })
                    .await?;
                debug!("[Registry] 消息分表就绪: {}", table);
                Ok::<_, StoreError>(Arc::new(MessagePartition { key, table }))
            })
            .await?;
        Ok(partition.clone())
    }

    /// 查找已存在的分表，不存在时返回 None 而不建表（读路径使用）
    pub async fn find_message_partition(&self, key: ConversationKey) -> Result<Option<Arc<MessagePartition>>> {
        key.validate()?;
        let known = self.partitions.lock().get(&key).cloned();
        if let Some(partition) = known.as_ref().and_then(|slot| slot.get()) {
            return Ok(Some(partition.clone()));
        }

        let table = MessagePartition::table_name(&key);
        let exists = {
            let mut conn = self.im.pool().acquire().await?;
            MessageDao::partition_exists(&mut conn, &table).await?
        };
        if !exists {
            return Ok(None);
        }

        // 之前的进程建过表，记忆下来
        let slot = {
            let mut partitions = self.partitions.lock();
            partitions.entry(key).or_default().clone()
        };
        let partition = slot
            .get_or_init(move || async move { Arc::new(MessagePartition { key, table }) })
            .await;
        Ok(Some(partition.clone()))
    }

    /// 已创建的分表（仅本进程内记忆的部分）
    pub fn known_partitions(&self) -> Vec<Arc<MessagePartition>> {
        self.partitions
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    async fn close(&self) {
        self.im.pool.close().await;
        self.user.pool.close().await;
    }
}

type StoreSlot = Arc<OnceCell<Arc<SessionStore>>>;

/// 存储注册表：会话用户 -> 存储句柄
pub struct StoreRegistry {
    config: Arc<StoreConfig>,
    process_tag: Arc<str>,
    stores: Mutex<HashMap<i64, StoreSlot>>,
}

impl StoreRegistry {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        let process_tag: Arc<str> = Arc::from(config.process_tag.as_str());
        Self {
            config,
            process_tag,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn store_key(&self, session_user_id: i64, kind: StoreKind) -> StoreKey {
        StoreKey {
            process_tag: self.process_tag.clone(),
            session_user_id,
            kind,
        }
    }

    /// 获取会话用户的存储句柄（幂等，首次访问时建库建表）
    pub async fn get_store(&self, session_user_id: i64) -> Result<Arc<SessionStore>> {
        if session_user_id <= 0 {
            return Err(StoreError::invalid(format!(
                "非法的会话用户 ID: {}",
                session_user_id
            )));
        }

        let slot = {
            let mut stores = self.stores.lock();
            stores.entry(session_user_id).or_default().clone()
        };

        let store = slot
            .get_or_try_init(|| self.open(session_user_id))
            .await?;
        Ok(store.clone())
    }

    async fn open(&self, session_user_id: i64) -> Result<Arc<SessionStore>> {
        let dir = self.config.session_dir(session_user_id);
        info!(
            "[Registry] 打开会话用户存储: uid={}, dir={}",
            session_user_id,
            dir.display()
        );

        let im_pool =
            create_sqlite_pool_with_migration(&dir.join("im.db"), &self.config, &IM_MIGRATOR)
                .await?;
        let user_pool =
            create_sqlite_pool_with_migration(&dir.join("user.db"), &self.config, &USER_MIGRATOR)
                .await?;

        Ok(Arc::new(SessionStore {
            session_user_id,
            im: DbHandle {
                key: self.store_key(session_user_id, StoreKind::Im),
                pool: im_pool,
            },
            user: DbHandle {
                key: self.store_key(session_user_id, StoreKind::User),
                pool: user_pool,
            },
            partitions: Mutex::new(HashMap::new()),
        }))
    }

    /// 关闭某个会话用户的存储，返回其句柄键（便于清理写队列）
    pub async fn close(&self, session_user_id: i64) -> Vec<StoreKey> {
        let slot = self.stores.lock().remove(&session_user_id);
        let Some(store) = slot.and_then(|s| s.get().cloned()) else {
            return Vec::new();
        };
        store.close().await;
        info!("[Registry] 已关闭会话用户存储: uid={}", session_user_id);
        vec![store.im.key.clone(), store.user.key.clone()]
    }

    /// 关闭所有已打开的存储
    pub async fn close_all(&self) -> Vec<StoreKey> {
        let stores: Vec<Arc<SessionStore>> = {
            let mut map = self.stores.lock();
            map.drain().filter_map(|(_, s)| s.get().cloned()).collect()
        };
        join_all(stores.iter().map(|s| s.close())).await;
        info!("[Registry] 已关闭全部存储，共 {} 个会话用户", stores.len());
        stores
            .iter()
            .flat_map(|s| [s.im.key.clone(), s.user.key.clone()])
            .collect()
    }

    /// 当前已打开的会话用户
    pub fn open_sessions(&self) -> Vec<i64> {
        self.stores
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(uid, _)| *uid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::testing::{init_test_logger, temp_config};
    use crate::im::types::ConversationType;

    #[tokio::test]
    async fn get_store_is_idempotent() {
        init_test_logger();
        let config = temp_config();
        let registry = StoreRegistry::new(Arc::new(config.clone()));

        let a = registry.get_store(42).await.unwrap();
        let b = registry.get_store(42).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(config.session_dir(42).join("im.db").exists());
        assert!(config.session_dir(42).join("user.db").exists());

        let c = registry.get_store(43).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.im().key(), c.im().key());

        let mut sessions = registry.open_sessions();
        sessions.sort();
        assert_eq!(sessions, vec![42, 43]);
    }

    #[tokio::test]
    async fn rejects_invalid_session() {
        let registry = StoreRegistry::new(Arc::new(temp_config()));
        let err = registry.get_store(0).await.err().unwrap();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn partition_is_created_once() {
        init_test_logger();
        let registry = StoreRegistry::new(Arc::new(temp_config()));
        let writer = WriteQueue::new();
        let store = registry.get_store(7).await.unwrap();
        let key = ConversationKey::new(ConversationType::Single, 1001);

        let p1 = store
            .create_message_partition_if_needed(&writer, key)
            .await
            .unwrap();
        let p2 = store
            .create_message_partition_if_needed(&writer, key)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(p1.table, "message_1_1001");

        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(&p1.table)
        .fetch_one(store.im().pool())
        .await
        .unwrap();
        assert_eq!(exists, 1);
        assert_eq!(store.known_partitions().len(), 1);
    }

    #[tokio::test]
    async fn find_partition_never_creates_table() {
        init_test_logger();
        let registry = StoreRegistry::new(Arc::new(temp_config()));
        let writer = WriteQueue::new();
        let store = registry.get_store(7).await.unwrap();
        let key = ConversationKey::new(ConversationType::Single, 55);

        assert!(store.find_message_partition(key).await.unwrap().is_none());
        assert!(store.known_partitions().is_empty());

        store
            .create_message_partition_if_needed(&writer, key)
            .await
            .unwrap();
        let found = store.find_message_partition(key).await.unwrap().unwrap();
        assert_eq!(found.table, "message_1_55");

        // 重新打开后从磁盘发现已有分表
        registry.close(7).await;
        let reopened = registry.get_store(7).await.unwrap();
        assert!(reopened.known_partitions().is_empty());
        let found = reopened.find_message_partition(key).await.unwrap().unwrap();
        assert_eq!(found.table, "message_1_55");
        assert_eq!(reopened.known_partitions().len(), 1);
    }

    #[tokio::test]
    async fn close_releases_handle() {
        let registry = StoreRegistry::new(Arc::new(temp_config()));
        let first = registry.get_store(9).await.unwrap();
        let keys = registry.close(9).await;
        assert_eq!(keys.len(), 2);
        assert!(first.im().pool().is_closed());

        let reopened = registry.get_store(9).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
        assert_eq!(registry.close_all().await.len(), 2);
    }
}
