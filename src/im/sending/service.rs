//! 待发送索引服务层

use crate::im::context::StoreDeps;
use crate::im::error::{Result, StoreError};
use crate::im::message::models::SendStatus;
use crate::im::sending::dao::SendingDao;
use crate::im::sending::models::SendingEntry;
use crate::im::types::{check_limit, ConversationKey, Page};
use tracing::{debug, error, info};

/// 待发送消息队列（持久化）
pub struct SendingQueue {
    deps: StoreDeps,
    resume_page_size: u32,
}

impl SendingQueue {
    pub(crate) fn new(deps: StoreDeps, resume_page_size: u32) -> Self {
        Self {
            deps,
            resume_page_size: resume_page_size.max(1),
        }
    }

    /// 新增待发送项，返回带 local_id 的记录
    pub async fn insert(&self, session_user_id: i64, entry: SendingEntry) -> Result<SendingEntry> {
        if entry.local_id.is_some() {
            return Err(StoreError::invalid("待发送项已有 local_id，不能重复插入"));
        }
        entry.key().validate()?;
        if entry.message_local_id <= 0 {
            return Err(StoreError::invalid("待发送项缺少 message_local_id"));
        }
        if entry.local_send_status == SendStatus::Success {
            return Err(StoreError::invalid("发送成功的消息不进入待发送队列"));
        }

        let store = self.deps.registry.get_store(session_user_id).await?;
        let local_id = self
            .deps
            .writer
            .execute_transaction(store.im(), move |conn| {
                Box::pin(async move {
                    SendingDao::insert(conn, &entry)
                        .await
                        .map_err(|e| e.for_write("待发送项"))
                })
            })
            .await?;

        debug!(
            "[SendQueue] 新增待发送项 local_id={}, key={:?}, message={}",
            local_id,
            entry.key(),
            entry.message_local_id
        );
        Ok(SendingEntry {
            local_id: Some(local_id),
            ..entry
        })
    }

    pub async fn get_by_id(&self, session_user_id: i64, local_id: i64) -> Result<Option<SendingEntry>> {
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        SendingDao::get_by_id(&mut conn, local_id).await
    }

    pub async fn get_by_target_message(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        message_local_id: i64,
    ) -> Result<Option<SendingEntry>> {
        key.validate()?;
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        SendingDao::get_by_target_message(&mut conn, &key, message_local_id).await
    }

    /// 按 local_id 升序分页，`after_local_id = 0` 从头开始
    pub async fn page_query(
        &self,
        session_user_id: i64,
        after_local_id: i64,
        limit: u32,
    ) -> Result<Page<SendingEntry>> {
        check_limit(limit)?;
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        let rows = SendingDao::page_query(&mut conn, after_local_id.max(0), limit as i64 + 1).await?;
        Ok(Page::from_overfetch(rows, limit))
    }

    /// 删除待发送项，返回是否删除了记录
    pub async fn remove(&self, session_user_id: i64, local_id: i64) -> Result<bool> {
        let store = self.deps.registry.get_store(session_user_id).await?;
        let rows = self
            .deps
            .writer
            .execute_transaction(store.im(), move |conn| {
                Box::pin(async move { SendingDao::remove(conn, local_id).await })
            })
            .await?;
        if rows != 1 {
            error!(
                "[SendQueue] 删除待发送项影响行数异常: local_id={}, rows={}",
                local_id, rows
            );
        }
        Ok(rows > 0)
    }

    /// 重启后恢复全部待发送项（按入队顺序）
    pub async fn resume_pending(&self, session_user_id: i64) -> Result<Vec<SendingEntry>> {
        let mut pending = Vec::new();
        let mut cursor = 0;
        let mut pages = 0;
        loop {
            let page = self
                .page_query(session_user_id, cursor, self.resume_page_size)
                .await?;
            pages += 1;
            if let Some(last) = page.items.last().and_then(|e| e.local_id) {
                cursor = last;
            }
            pending.extend(page.items);
            if !page.has_more {
                break;
            }
        }
        info!(
            "[SendQueue] 恢复待发送项: session={}, 共 {} 条, {} 页",
            session_user_id,
            pending.len(),
            pages
        );
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::context::StoreContext;
    use crate::im::testing::{init_test_logger, temp_config, test_context, ManualClock};
    use crate::im::types::ConversationType;

    fn entry(target: i64, message_local_id: i64) -> SendingEntry {
        SendingEntry::new(
            ConversationKey::new(ConversationType::Single, target),
            message_local_id,
            SendStatus::Sending,
        )
    }

    #[tokio::test]
    async fn insert_and_lookup() {
        let (ctx, _clock) = test_context();
        let queue = ctx.sending();

        let saved = queue.insert(1, entry(100, 5)).await.unwrap();
        let id = saved.local_id.unwrap();

        let by_id = queue.get_by_id(1, id).await.unwrap().unwrap();
        assert_eq!(by_id, saved);

        let by_target = queue
            .get_by_target_message(1, saved.key(), 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_target.local_id, Some(id));

        assert!(queue.get_by_id(1, id + 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_bad_entries() {
        let (ctx, _clock) = test_context();
        let queue = ctx.sending();

        let mut with_id = entry(100, 1);
        with_id.local_id = Some(3);
        assert!(queue.insert(1, with_id).await.unwrap_err().is_invalid_argument());

        assert!(queue.insert(1, entry(0, 1)).await.unwrap_err().is_invalid_argument());

        let mut done = entry(100, 1);
        done.local_send_status = SendStatus::Success;
        assert!(queue.insert(1, done).await.unwrap_err().is_invalid_argument());

        queue.insert(1, entry(100, 1)).await.unwrap();
        let dup = queue.insert(1, entry(100, 1)).await.unwrap_err();
        assert!(matches!(dup, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn page_query_is_ascending_and_resume_drains_all() {
        let (ctx, _clock) = test_context();
        let queue = ctx.sending();

        let mut ids = Vec::new();
        for i in 1..=5 {
            ids.push(queue.insert(1, entry(100 + i, i)).await.unwrap().local_id.unwrap());
        }

        let first = queue.page_query(1, 0, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.items[0].local_id, Some(ids[0]));
        assert_eq!(first.items[1].local_id, Some(ids[1]));

        let rest = queue.page_query(1, ids[1], 10).await.unwrap();
        assert_eq!(rest.items.len(), 3);
        assert!(!rest.has_more);

        assert!(queue.remove(1, ids[2]).await.unwrap());
        assert!(!queue.remove(1, ids[2]).await.unwrap());

        let pending = queue.resume_pending(1).await.unwrap();
        let got: Vec<i64> = pending.iter().filter_map(|e| e.local_id).collect();
        assert_eq!(got, vec![ids[0], ids[1], ids[3], ids[4]]);
    }

    #[tokio::test]
    async fn resume_drains_across_many_pages() {
        init_test_logger();
        let ctx = StoreContext::with_clock(
            temp_config().with_resume_page_size(3),
            ManualClock::new(1_000),
        );
        let queue = ctx.sending();

        let mut ids = Vec::new();
        for i in 1..=11 {
            ids.push(queue.insert(1, entry(500, i)).await.unwrap().local_id.unwrap());
        }
        // 删掉页边界上的和末尾的几项
        for gone in [ids[2], ids[5], ids[10]] {
            assert!(queue.remove(1, gone).await.unwrap());
        }
        let expected: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| ![ids[2], ids[5], ids[10]].contains(id))
            .collect();

        let pending = queue.resume_pending(1).await.unwrap();
        let got: Vec<i64> = pending.iter().filter_map(|e| e.local_id).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn resume_drains_past_default_page_size() {
        let (ctx, _clock) = test_context();
        let queue = ctx.sending();
        let store = ctx.registry().get_store(1).await.unwrap();

        // 直接批量写入，避免 450 个独立事务
        let mut tx = store.im().pool().begin().await.unwrap();
        for i in 1..=450 {
            SendingDao::insert(&mut *tx, &entry(600 + i % 7, i)).await.unwrap();
        }
        tx.commit().await.unwrap();

        let pending = queue.resume_pending(1).await.unwrap();
        assert_eq!(pending.len(), 450);
        let ids: Vec<i64> = pending.iter().filter_map(|e| e.local_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let messages: std::collections::HashSet<i64> =
            pending.iter().map(|e| e.message_local_id).collect();
        assert_eq!(messages.len(), 450);
    }
}
