//! 用户资料缓存服务层

use crate::im::cache::LruCache;
use crate::im::context::StoreDeps;
use crate::im::error::{Result, StoreError};
use crate::im::notify::UserInfoEvent;
use crate::im::user::dao::UserInfoDao;
use crate::im::user::models::{UserCacheKey, UserInfo};
use std::collections::HashMap;
use tracing::{debug, info};

/// 用户资料缓存
pub struct UserInfoStore {
    deps: StoreDeps,
    cache: LruCache<UserCacheKey, UserInfo>,
}

impl UserInfoStore {
    pub(crate) fn new(deps: StoreDeps, cache_capacity: usize) -> Self {
        Self {
            deps,
            cache: LruCache::new(cache_capacity),
        }
    }

    pub async fn get_by_user_id(&self, session_user_id: i64, uid: i64) -> Result<Option<UserInfo>> {
        let cache_key = UserCacheKey { session_user_id, uid };
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(Some(hit));
        }

        let generation = self.cache.generation();
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.user().pool().acquire().await?;
        let found = UserInfoDao::get(&mut conn, uid).await?;
        if let Some(info) = &found {
            self.cache
                .insert_if_current(generation, vec![(cache_key, info.clone())]);
        }
        Ok(found)
    }

    /// 批量读取（不经过缓存），按传入顺序返回存在的记录
    pub async fn get_by_user_id_batch(&self, session_user_id: i64, uids: &[i64]) -> Result<Vec<UserInfo>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.user().pool().acquire().await?;
        let mut by_uid: HashMap<i64, UserInfo> = UserInfoDao::get_batch(&mut conn, uids)
            .await?
            .into_iter()
            .map(|info| (info.uid, info))
            .collect();
        Ok(uids.iter().filter_map(|uid| by_uid.remove(uid)).collect())
    }

    /// 写入资料，只接受服务端版本严格更新的记录
    ///
    /// 返回是否写入；版本不新时不改动任何数据（包括 `local_last_modify_ms`）。
    pub async fn insert_or_update(&self, session_user_id: i64, info: UserInfo) -> Result<bool> {
        if info.uid <= 0 {
            return Err(StoreError::invalid(format!("非法的用户 ID: {}", info.uid)));
        }
        let uid = info.uid;
        let mut row = info;
        row.local_last_modify_ms = self.deps.clock.now_ms();

        let store = self.deps.registry.get_store(session_user_id).await?;
        let rows = self
            .deps
            .writer
            .execute_transaction_then(
                store.user(),
                move |conn| Box::pin(async move { UserInfoDao::upsert_if_newer(conn, &row).await }),
                self.publish_if(session_user_id, uid, |rows: &u64| *rows > 0),
            )
            .await?;

        if rows == 0 {
            debug!("[UserStore] 资料版本不新，忽略: uid={}", uid);
            return Ok(false);
        }
        self.invalidate(session_user_id, uid);
        Ok(true)
    }

    /// 标记用户存在（不存在时插入空资料占位），返回是否新插入
    pub async fn touch(&self, session_user_id: i64, uid: i64) -> Result<bool> {
        if uid <= 0 {
            return Err(StoreError::invalid(format!("非法的用户 ID: {}", uid)));
        }
        let now = self.deps.clock.now_ms();
        let store = self.deps.registry.get_store(session_user_id).await?;
        let inserted = self
            .deps
            .writer
            .execute_transaction_then(
                store.user(),
                move |conn| Box::pin(async move { UserInfoDao::touch(conn, uid, now).await }),
                self.publish_if(session_user_id, uid, |inserted: &bool| *inserted),
            )
            .await?;
        if inserted {
            info!("[UserStore] 新增资料占位: uid={}", uid);
            self.invalidate(session_user_id, uid);
        }
        Ok(inserted)
    }

    /// 提交后在写队列内派发通知，`changed` 判断这次写入是否真的改了数据
    fn publish_if<T, C>(&self, session_user_id: i64, uid: i64, changed: C) -> impl FnOnce(&T) + Send + 'static
    where
        T: 'static,
        C: Fn(&T) -> bool + Send + 'static,
    {
        let bus = self.deps.bus.clone();
        move |value: &T| {
            if changed(value) {
                bus.publish_user_info(UserInfoEvent { session_user_id, uid });
            }
        }
    }

    fn invalidate(&self, session_user_id: i64, uid: i64) {
        self.cache.invalidate(&UserCacheKey { session_user_id, uid });
    }

    pub(crate) fn evict_session(&self, session_user_id: i64) {
        self.cache
            .invalidate_where(|k| k.session_user_id == session_user_id);
    }
}
