//! 会话存储服务层
//!
//! 读路径先查缓存，未命中时回源并同时写入按 ID 和按目标用户两个缓存键；
//! 写路径经写队列串行提交，提交后失效缓存并派发通知。

use crate::im::cache::LruCache;
use crate::im::context::StoreDeps;
use crate::im::conversation::dao::ConversationDao;
use crate::im::conversation::models::LocalConversation;
use crate::im::error::{Result, StoreError};
use crate::im::notify::ConversationEvent;
use crate::im::sequence::Sequence;
use crate::im::types::{check_limit, ConversationKey, ConversationType, Page, SeqCursor};
use tracing::{debug, error, info, warn};

/// 会话缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationCacheKey {
    ById { session_user_id: i64, local_id: i64 },
    ByTarget { session_user_id: i64, key: ConversationKey },
}

impl ConversationCacheKey {
    fn session_user_id(&self) -> i64 {
        match self {
            ConversationCacheKey::ById { session_user_id, .. } => *session_user_id,
            ConversationCacheKey::ByTarget { session_user_id, .. } => *session_user_id,
        }
    }
}

/// 一次更新在事务内观察到的结果
struct UpdateOutcome {
    rows: u64,
    before: Option<LocalConversation>,
    after: Option<LocalConversation>,
}

/// 会话存储
pub struct ConversationStore {
    deps: StoreDeps,
    cache: LruCache<ConversationCacheKey, LocalConversation>,
    /// 会话用户 -> 总未读数
    unread: LruCache<i64, i64>,
}

impl ConversationStore {
    pub(crate) fn new(deps: StoreDeps, cache_capacity: usize, unread_capacity: usize) -> Self {
        Self {
            deps,
            cache: LruCache::new(cache_capacity),
            unread: LruCache::new(unread_capacity),
        }
    }

    /// 按 (seq, local_id) 倒序分页
    ///
    /// `SeqCursor::START` 从最新处开始，下一页使用返回的 `next_cursor`；
    /// `conversation_type` 为 None 时不过滤类型。
    pub async fn page_query(
        &self,
        session_user_id: i64,
        conversation_type: Option<ConversationType>,
        before: SeqCursor,
        limit: u32,
        include_deleted: bool,
    ) -> Result<Page<LocalConversation>> {
        check_limit(limit)?;
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        let rows = ConversationDao::page_query(
            &mut conn,
            conversation_type,
            before.normalized(),
            limit as i64 + 1,
            include_deleted,
        )
        .await?;
        Ok(Page::from_seq_overfetch(rows, limit))
    }

    pub async fn get_by_id(&self, session_user_id: i64, local_id: i64) -> Result<Option<LocalConversation>> {
        let cache_key = ConversationCacheKey::ById {
            session_user_id,
            local_id,
        };
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(Some(hit));
        }

        let generation = self.cache.generation();
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        let found = ConversationDao::get_by_id(&mut conn, local_id).await?;
        if let Some(conv) = &found {
            self.fill(session_user_id, generation, conv);
        }
        Ok(found)
    }

    pub async fn get_by_target(
        &self,
        session_user_id: i64,
        key: ConversationKey,
    ) -> Result<Option<LocalConversation>> {
        key.validate()?;
        let cache_key = ConversationCacheKey::ByTarget {
            session_user_id,
            key,
        };
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(Some(hit));
        }

        let generation = self.cache.generation();
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        let found = ConversationDao::get_by_target(&mut conn, &key).await?;
        if let Some(conv) = &found {
            self.fill(session_user_id, generation, conv);
        }
        Ok(found)
    }

    fn fill(&self, session_user_id: i64, generation: u64, conv: &LocalConversation) {
        let Some(local_id) = conv.local_id else {
            return;
        };
        let entries = vec![
            (
                ConversationCacheKey::ById {
                    session_user_id,
                    local_id,
                },
                conv.clone(),
            ),
            (
                ConversationCacheKey::ByTarget {
                    session_user_id,
                    key: conv.key(),
                },
                conv.clone(),
            ),
        ];
        if !self.cache.insert_if_current(generation, entries) {
            debug!("[ConvStore] 回源期间缓存已失效，放弃写回: local_id={}", local_id);
        }
    }

    fn invalidate(&self, session_user_id: i64, local_id: i64, key: ConversationKey) {
        self.cache.invalidate(&ConversationCacheKey::ById {
            session_user_id,
            local_id,
        });
        self.cache.invalidate(&ConversationCacheKey::ByTarget {
            session_user_id,
            key,
        });
    }

    /// 新增会话，返回带 local_id 的记录
    pub async fn insert(&self, session_user_id: i64, conversation: LocalConversation) -> Result<LocalConversation> {
        if conversation.local_id.is_some() {
            return Err(StoreError::invalid("会话已有 local_id，请使用 update"));
        }
        conversation.key().validate()?;

        let mut conv = conversation;
        conv.local_last_modify_ms = self.deps.clock.now_ms();

        let store = self.deps.registry.get_store(session_user_id).await?;
        let row = conv.clone();
        let mut created = conv.clone();
        let bus = self.deps.bus.clone();
        let local_id = self
            .deps
            .writer
            .execute_transaction_then(
                store.im(),
                move |conn| {
                    Box::pin(async move {
                        ConversationDao::insert(conn, &row)
                            .await
                            .map_err(|e| e.for_write("会话"))
                    })
                },
                move |local_id: &i64| {
                    created.local_id = Some(*local_id);
                    bus.publish_conversation(ConversationEvent::Created {
                        session_user_id,
                        conversation: created,
                    });
                },
            )
            .await?;
        conv.local_id = Some(local_id);

        // 推进缓存代数，插入前开始的回源不再写回
        self.invalidate(session_user_id, local_id, conv.key());
        if conv.local_unread_count != 0 {
            self.unread.invalidate(&session_user_id);
        }

        info!(
            "[ConvStore] 新增会话: session={}, local_id={}, key={:?}",
            session_user_id,
            local_id,
            conv.key()
        );
        Ok(conv)
    }

    /// 按 local_id 更新会话，返回是否更新了记录
    ///
    /// 通知携带提交后重新读取的记录，而不是调用方传入的副本。
    pub async fn update(&self, session_user_id: i64, conversation: LocalConversation) -> Result<bool> {
        let Some(local_id) = conversation.local_id else {
            return Err(StoreError::invalid("更新会话需要 local_id"));
        };
        self.commit_update(session_user_id, local_id, "更新", move |row| *row = conversation)
            .await
    }

    /// 在写事务内读取当前记录、修改后写回
    ///
    /// 读改写整体在写队列中完成，不会覆盖并发提交的其他修改。
    /// 通知在提交后、释放写队列前派发。
    async fn commit_update<E>(&self, session_user_id: i64, local_id: i64, what: &'static str, edit: E) -> Result<bool>
    where
        E: FnOnce(&mut LocalConversation) + Send + 'static,
    {
        let now = self.deps.clock.now_ms();
        let store = self.deps.registry.get_store(session_user_id).await?;
        let bus = self.deps.bus.clone();
        let outcome = self
            .deps
            .writer
            .execute_transaction_then(
                store.im(),
                move |conn| {
                    Box::pin(async move {
                        let Some(before) = ConversationDao::get_by_id(conn, local_id).await? else {
                            return Ok(UpdateOutcome {
                                rows: 0,
                                before: None,
                                after: None,
                            });
                        };
                        let mut row = before.clone();
                        edit(&mut row);
                        row.local_last_modify_ms = now;
                        let rows = ConversationDao::update(conn, local_id, &row).await?;
                        let after = ConversationDao::get_by_id(conn, local_id).await?;
                        Ok(UpdateOutcome {
                            rows,
                            before: Some(before),
                            after,
                        })
                    })
                },
                move |outcome: &UpdateOutcome| {
                    if let Some(after) = &outcome.after {
                        bus.publish_conversation(ConversationEvent::Changed {
                            session_user_id,
                            conversation: after.clone(),
                        });
                    }
                },
            )
            .await?;

        if outcome.rows != 1 {
            error!(
                "[ConvStore] {}会话影响行数异常: session={}, local_id={}, rows={}",
                what, session_user_id, local_id, outcome.rows
            );
        }

        if let Some(after) = &outcome.after {
            self.invalidate(session_user_id, local_id, after.key());
            let aggregate_changed = match &outcome.before {
                Some(before) => {
                    before.local_unread_count != after.local_unread_count
                        || before.local_delete != after.local_delete
                }
                None => true,
            };
            if aggregate_changed {
                self.unread.invalidate(&session_user_id);
            }
        }
        Ok(outcome.rows > 0)
    }

    /// 所有未删除会话的未读数之和
    pub async fn get_all_unread_count(&self, session_user_id: i64) -> Result<i64> {
        if let Some(total) = self.unread.get(&session_user_id) {
            return Ok(total);
        }
        let generation = self.unread.generation();
        let store = self.deps.registry.get_store(session_user_id).await?;
        let mut conn = store.im().pool().acquire().await?;
        let total = ConversationDao::sum_unread(&mut conn).await?;
        self.unread
            .insert_if_current(generation, vec![(session_user_id, total)]);
        Ok(total)
    }

    /// 取已有会话，不存在则以当前时间为 seq 新建
    pub async fn get_or_create(&self, session_user_id: i64, key: ConversationKey) -> Result<LocalConversation> {
        if let Some(existing) = self.get_by_target(session_user_id, key).await? {
            return Ok(existing);
        }

        let mut conv = LocalConversation::new(key.conversation_type, key.target_user_id);
        conv.local_seq = Sequence::now(false, self.deps.clock.as_ref());
        conv.local_time_ms = self.deps.clock.now_ms();
        match self.insert(session_user_id, conv).await {
            Ok(created) => Ok(created),
            Err(StoreError::Duplicate(_)) => {
                // 并发创建，读取胜出者
                warn!("[ConvStore] 会话已被并发创建: key={:?}", key);
                self.get_by_target(session_user_id, key)
                    .await?
                    .ok_or_else(|| StoreError::Task(format!("会话创建后无法读取: {:?}", key)))
            }
            Err(e) => Err(e),
        }
    }

    /// 置顶/取消置顶：只改 seq 的置顶位，保留时间部分
    pub async fn set_pinned(&self, session_user_id: i64, local_id: i64, pinned: bool) -> Result<bool> {
        self.commit_update(session_user_id, local_id, "置顶", move |row| {
            row.local_seq = Sequence::with_pinned(row.local_seq, pinned);
        })
        .await
    }

    /// 软删除（会话记录不会物理删除）
    pub async fn soft_delete(&self, session_user_id: i64, local_id: i64) -> Result<bool> {
        self.commit_update(session_user_id, local_id, "删除", |row| row.local_delete = true)
            .await
    }

    /// 会话用户关闭时清理其缓存
    pub(crate) fn evict_session(&self, session_user_id: i64) {
        self.cache
            .invalidate_where(|k| k.session_user_id() == session_user_id);
        self.unread.invalidate(&session_user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::conversation::listener::ConversationListener;
    use crate::im::testing::test_context;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn single(target: i64) -> ConversationKey {
        ConversationKey::new(ConversationType::Single, target)
    }

    fn conversation(target: i64, seq: i64, unread: i64) -> LocalConversation {
        let mut c = LocalConversation::new(ConversationType::Single, target);
        c.local_seq = seq;
        c.local_unread_count = unread;
        c.local_time_ms = seq / 1000;
        c
    }

    #[tokio::test]
    async fn insert_then_read_back_by_both_paths() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        let mut conv = conversation(200, 1_000, 3);
        conv.flags.matched = true;
        conv.remote_message_end = 77;
        let saved = store.insert(1, conv).await.unwrap();
        let id = saved.local_id.unwrap();

        let by_id = store.get_by_id(1, id).await.unwrap().unwrap();
        let by_target = store.get_by_target(1, single(200)).await.unwrap().unwrap();
        assert_eq!(by_id, saved);
        assert_eq!(by_target, saved);
        assert_eq!(by_target.local_id, Some(id));

        assert!(store.get_by_id(1, id + 1).await.unwrap().is_none());
        assert!(store.get_by_target(1, single(201)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_assigned_id_and_duplicate_target() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        let mut with_id = conversation(5, 1, 0);
        with_id.local_id = Some(9);
        assert!(store.insert(1, with_id).await.unwrap_err().is_invalid_argument());
        assert!(store
            .insert(1, conversation(0, 1, 0))
            .await
            .unwrap_err()
            .is_invalid_argument());

        store.insert(1, conversation(5, 1, 0)).await.unwrap();
        let dup = store.insert(1, conversation(5, 2, 0)).await.unwrap_err();
        assert!(matches!(dup, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn update_is_visible_through_cache() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        let saved = store.insert(1, conversation(300, 10, 0)).await.unwrap();
        let id = saved.local_id.unwrap();
        // 预热两个缓存键
        store.get_by_id(1, id).await.unwrap();
        store.get_by_target(1, single(300)).await.unwrap();

        let mut changed = saved.clone();
        changed.local_show_message_id = 42;
        changed.flags.connected = true;
        assert!(store.update(1, changed).await.unwrap());

        let by_id = store.get_by_id(1, id).await.unwrap().unwrap();
        let by_target = store.get_by_target(1, single(300)).await.unwrap().unwrap();
        assert_eq!(by_id.local_show_message_id, 42);
        assert!(by_target.flags.connected);

        let mut missing = saved.clone();
        missing.local_id = Some(id + 100);
        assert!(!store.update(1, missing).await.unwrap());
    }

    #[tokio::test]
    async fn page_query_orders_by_seq_and_reports_has_more() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        for (target, seq) in [(1, 30), (2, 10), (3, 50), (4, 20), (5, 40)] {
            store.insert(1, conversation(target, seq, 0)).await.unwrap();
        }

        let first = store.page_query(1, None, SeqCursor::START, 2, false).await.unwrap();
        let seqs: Vec<i64> = first.items.iter().map(|c| c.local_seq).collect();
        assert_eq!(seqs, vec![50, 40]);
        assert!(first.has_more);

        let rest = store
            .page_query(1, None, first.next_cursor.unwrap(), 3, false)
            .await
            .unwrap();
        let seqs: Vec<i64> = rest.items.iter().map(|c| c.local_seq).collect();
        assert_eq!(seqs, vec![30, 20, 10]);
        assert!(!rest.has_more);

        let exact = store.page_query(1, None, SeqCursor::START, 5, false).await.unwrap();
        assert_eq!(exact.items.len(), 5);
        assert!(!exact.has_more);

        let system = store
            .page_query(1, Some(ConversationType::System), SeqCursor::START, 5, false)
            .await
            .unwrap();
        assert!(system.items.is_empty());

        assert!(store.page_query(1, None, SeqCursor::START, 0, false).await.is_err());
    }

    #[tokio::test]
    async fn unread_total_tracks_updates_and_deletes() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        let a = store.insert(1, conversation(1, 1, 2)).await.unwrap();
        store.insert(1, conversation(2, 2, 5)).await.unwrap();
        assert_eq!(store.get_all_unread_count(1).await.unwrap(), 7);

        let mut read = a.clone();
        read.local_unread_count = 0;
        store.update(1, read).await.unwrap();
        assert_eq!(store.get_all_unread_count(1).await.unwrap(), 5);

        store.insert(1, conversation(3, 3, 4)).await.unwrap();
        assert_eq!(store.get_all_unread_count(1).await.unwrap(), 9);

        let b = store.get_by_target(1, single(2)).await.unwrap().unwrap();
        assert!(store.soft_delete(1, b.local_id.unwrap()).await.unwrap());
        assert_eq!(store.get_all_unread_count(1).await.unwrap(), 4);

        // 删除的会话默认不出现在分页里
        let visible = store.page_query(1, None, SeqCursor::START, 10, false).await.unwrap();
        assert_eq!(visible.items.len(), 2);
        let all = store.page_query(1, None, SeqCursor::START, 10, true).await.unwrap();
        assert_eq!(all.items.len(), 3);
    }

    #[tokio::test]
    async fn pinned_conversation_sorts_first() {
        let (ctx, clock) = test_context();
        let store = ctx.conversations();

        let old = store.get_or_create(1, single(10)).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let newer = store.get_or_create(1, single(11)).await.unwrap();
        assert!(newer.local_seq > old.local_seq);

        assert!(store.set_pinned(1, old.local_id.unwrap(), true).await.unwrap());
        let page = store.page_query(1, None, SeqCursor::START, 10, false).await.unwrap();
        assert_eq!(page.items[0].target_user_id, 10);
        assert!(Sequence::is_pinned(page.items[0].local_seq));
        assert_eq!(
            Sequence::time_micros(page.items[0].local_seq),
            Sequence::time_micros(old.local_seq)
        );

        store.set_pinned(1, old.local_id.unwrap(), false).await.unwrap();
        let page = store.page_query(1, None, SeqCursor::START, 10, false).await.unwrap();
        assert_eq!(page.items[0].target_user_id, 11);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        let a = store.get_or_create(1, single(99)).await.unwrap();
        let b = store.get_or_create(1, single(99)).await.unwrap();
        assert_eq!(a.local_id, b.local_id);
        assert!(a.local_seq > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_apply_one_after_another() {
        let (ctx, _clock) = test_context();
        let ctx = Arc::new(ctx);
        let saved = ctx
            .conversations()
            .insert(1, conversation(1, 1, 0))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 1..=2i64 {
            let ctx = ctx.clone();
            let mut conv = saved.clone();
            conv.local_unread_count = n;
            conv.remote_unread = n;
            handles.push(tokio::spawn(async move {
                ctx.conversations().update(1, conv).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap());
        }

        let fin = ctx
            .conversations()
            .get_by_id(1, saved.local_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        // 两个字段来自同一次写入
        assert_eq!(fin.local_unread_count, fin.remote_unread);
    }

    struct Recorder(mpsc::UnboundedSender<(bool, LocalConversation)>);

    #[async_trait]
    impl ConversationListener for Recorder {
        async fn on_conversation_created(&self, _s: i64, c: LocalConversation) {
            let _ = self.0.send((true, c));
        }
        async fn on_conversation_changed(&self, _s: i64, c: LocalConversation) {
            let _ = self.0.send((false, c));
        }
    }

    #[tokio::test]
    async fn changed_event_carries_committed_record() {
        let (ctx, _clock) = test_context();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = ctx.bus().subscribe_conversation(Arc::new(Recorder(tx)));
        let store = ctx.conversations();

        let saved = store.insert(1, conversation(8, 8, 0)).await.unwrap();
        let (created, first) = rx.recv().await.unwrap();
        assert!(created);
        assert_eq!(first.local_id, saved.local_id);

        // 调用方副本里的类型/目标被忽略，通知里是库中的记录
        let mut edit = saved.clone();
        edit.remote_unread = 6;
        edit.target_user_id = 12345;
        store.update(1, edit).await.unwrap();
        let (created, second) = rx.recv().await.unwrap();
        assert!(!created);
        assert_eq!(second.remote_unread, 6);
        assert_eq!(second.target_user_id, 8);
    }

    #[tokio::test]
    async fn paging_does_not_skip_equal_seqs() {
        let (ctx, _clock) = test_context();
        let store = ctx.conversations();

        let mut expected = Vec::new();
        for target in 1..=4 {
            let saved = store.insert(1, conversation(target, 700, 0)).await.unwrap();
            expected.push(saved.local_id.unwrap());
        }
        expected.reverse();

        let mut seen = Vec::new();
        let mut cursor = SeqCursor::START;
        loop {
            let page = store.page_query(1, None, cursor, 1, false).await.unwrap();
            seen.extend(page.items.iter().filter_map(|c| c.local_id));
            match page.next_cursor {
                Some(next) => cursor = next,
                None => break,
            }
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn soft_delete_keeps_concurrent_update() {
        let (ctx, _clock) = test_context();
        let ctx = Arc::new(ctx);

        for round in 0..10i64 {
            let saved = ctx
                .conversations()
                .insert(1, conversation(1_000 + round, 1, 0))
                .await
                .unwrap();
            let id = saved.local_id.unwrap();
            // 缓存预热，置顶/删除不能基于缓存里的旧记录改写
            ctx.conversations().get_by_id(1, id).await.unwrap();

            let mut read = saved.clone();
            read.local_unread_count = 7;
            let updater = {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.conversations().update(1, read).await })
            };
            let deleter = {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.conversations().soft_delete(1, id).await })
            };
            let pinner = {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.conversations().set_pinned(1, id, true).await })
            };
            assert!(updater.await.unwrap().unwrap());
            assert!(deleter.await.unwrap().unwrap());
            assert!(pinner.await.unwrap().unwrap());

            // 无论提交先后，删除和置顶都不会改动未读数
            let fin = ctx.conversations().get_by_id(1, id).await.unwrap().unwrap();
            assert_eq!(fin.local_unread_count, 7, "并发更新被覆盖: {:?}", fin);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn change_events_follow_commit_order() {
        let (ctx, _clock) = test_context();
        let ctx = Arc::new(ctx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = ctx.bus().subscribe_conversation(Arc::new(Recorder(tx)));

        let saved = ctx
            .conversations()
            .insert(1, conversation(3, 3, 0))
            .await
            .unwrap();
        let _ = rx.recv().await.unwrap();

        let mut handles = Vec::new();
        for n in 1..=16i64 {
            let ctx = ctx.clone();
            let mut conv = saved.clone();
            conv.remote_unread = n;
            handles.push(tokio::spawn(async move {
                ctx.conversations().update(1, conv).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap());
        }

        let mut last = None;
        for _ in 0..16 {
            let (created, conv) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(!created);
            last = Some(conv);
        }
        let stored = ctx
            .conversations()
            .get_by_id(1, saved.local_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        // 最后一条通知就是最终落库的记录
        assert_eq!(last.unwrap(), stored);
    }
}
