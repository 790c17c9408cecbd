//! 消息存储服务层
//!
//! 每个会话的消息在独立分表中，首次访问某个会话时建表。
//! 消息写入与待发送索引的维护在同一个事务里完成。

use crate::im::context::StoreDeps;
use crate::im::error::{Result, StoreError};
use crate::im::message::dao::MessageDao;
use crate::im::message::models::{LocalMessage, SendStatus};
use crate::im::notify::MessageEvent;
use crate::im::registry::{MessagePartition, SessionStore};
use crate::im::sending::dao::SendingDao;
use crate::im::sequence::Sequence;
use crate::im::types::{check_limit, ConversationKey, Page, SeqCursor};
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 同一发送者相邻消息归入同一块的最大时间间隔
const BLOCK_WINDOW_MS: i64 = 3 * 60 * 1000;

/// 一次修改在事务内观察到的结果
struct ChangeOutcome {
    rows: u64,
    after: Option<LocalMessage>,
}

/// 消息存储
pub struct MessageStore {
    deps: StoreDeps,
}

impl MessageStore {
    pub(crate) fn new(deps: StoreDeps) -> Self {
        Self { deps }
    }

    /// 分表必须在进入写事务之前就绪（建表本身也走写队列）
    async fn partition(
        &self,
        session_user_id: i64,
        key: ConversationKey,
    ) -> Result<(Arc<SessionStore>, Arc<MessagePartition>)> {
        let store = self.deps.registry.get_store(session_user_id).await?;
        let partition = store
            .create_message_partition_if_needed(&self.deps.writer, key)
            .await?;
        Ok((store, partition))
    }

    /// 读路径只查找已有分表，会话从未写过消息时不建表
    async fn existing_partition(
        &self,
        session_user_id: i64,
        key: ConversationKey,
    ) -> Result<Option<(Arc<SessionStore>, Arc<MessagePartition>)>> {
        let store = self.deps.registry.get_store(session_user_id).await?;
        let partition = store.find_message_partition(key).await?;
        Ok(partition.map(|p| (store, p)))
    }

    /// 按 (seq, local_id) 倒序分页，`SeqCursor::START` 从最新处开始
    ///
    /// 下一页使用返回的 `next_cursor`；seq 相同的消息不会被跳过。
    pub async fn page_query(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        before: SeqCursor,
        limit: u32,
    ) -> Result<Page<LocalMessage>> {
        check_limit(limit)?;
        let Some((store, partition)) = self.existing_partition(session_user_id, key).await? else {
            return Ok(Page::empty());
        };
        let mut conn = store.im().pool().acquire().await?;
        let rows = MessageDao::page_query(
            &mut conn,
            &partition.table,
            before.normalized(),
            limit as i64 + 1,
        )
        .await?;
        Ok(Page::from_seq_overfetch(rows, limit))
    }

    pub async fn get_by_id(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        local_id: i64,
    ) -> Result<Option<LocalMessage>> {
        let Some((store, partition)) = self.existing_partition(session_user_id, key).await? else {
            return Ok(None);
        };
        let mut conn = store.im().pool().acquire().await?;
        MessageDao::get_by_id(&mut conn, &partition.table, local_id).await
    }

    pub async fn get_by_remote_id(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        remote_message_id: i64,
    ) -> Result<Option<LocalMessage>> {
        let Some((store, partition)) = self.existing_partition(session_user_id, key).await? else {
            return Ok(None);
        };
        let mut conn = store.im().pool().acquire().await?;
        MessageDao::get_by_remote_id(&mut conn, &partition.table, remote_message_id).await
    }

    /// 新增消息，返回带 local_id 的记录
    ///
    /// seq 为 0 时取当前时间；块 ID 为 0 时按前一条消息计算。
    /// 未到终态的消息同时写入待发送索引。
    /// 会话的展示消息、未读数不在这里维护，由调用方另行更新会话。
    pub async fn insert(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        message: LocalMessage,
    ) -> Result<LocalMessage> {
        if message.local_id.is_some() {
            return Err(StoreError::invalid("消息已有 local_id，请使用 update"));
        }
        key.validate()?;

        let now = self.deps.clock.now_ms();
        let mut msg = message;
        if msg.local_seq == 0 {
            msg.local_seq = Sequence::now(false, self.deps.clock.as_ref());
        }
        if msg.local_time_ms == 0 {
            msg.local_time_ms = now;
        }
        msg.local_last_modify_ms = now;

        let (store, partition) = self.partition(session_user_id, key).await?;
        let table = partition.table.clone();
        let bus = self.deps.bus.clone();
        let saved = self
            .deps
            .writer
            .execute_transaction_then(
                store.im(),
                move |conn| {
                    Box::pin(async move {
                        if msg.local_block_id == 0 {
                            msg.local_block_id = Self::next_block_id(conn, &table, &msg).await?;
                        }
                        let local_id = MessageDao::insert(conn, &table, &msg).await?;
                        if !msg.local_send_status.is_terminal() {
                            SendingDao::upsert(conn, &key, local_id, msg.local_send_status).await?;
                        }
                        msg.local_id = Some(local_id);
                        Ok(msg)
                    })
                },
                move |saved: &LocalMessage| {
                    bus.publish_message(MessageEvent::Created {
                        session_user_id,
                        key,
                        message: saved.clone(),
                    });
                },
            )
            .await?;

        debug!(
            "[MsgStore] 新增消息: session={}, table={}, local_id={:?}, block={}",
            session_user_id, partition.table, saved.local_id, saved.local_block_id
        );
        Ok(saved)
    }

    /// 前一条消息同一发送者且间隔在窗口内则沿用其块，否则开新块
    async fn next_block_id(conn: &mut SqliteConnection, table: &str, msg: &LocalMessage) -> Result<i64> {
        let previous = MessageDao::latest_at_or_before(conn, table, msg.local_seq).await?;
        Ok(match previous {
            Some(prev)
                if prev.from_user_id == msg.from_user_id
                    && (msg.local_time_ms - prev.local_time_ms).abs() <= BLOCK_WINDOW_MS =>
            {
                prev.local_block_id
            }
            Some(prev) => prev.local_block_id + 1,
            None => 1,
        })
    }

    /// 待发送索引与消息状态保持一致：成功则移除，否则插入或刷新
    async fn reconcile_sending(
        conn: &mut SqliteConnection,
        key: &ConversationKey,
        local_id: i64,
        status: SendStatus,
    ) -> Result<()> {
        if status.is_terminal() {
            SendingDao::remove_by_target_message(conn, key, local_id).await?;
        } else {
            SendingDao::upsert(conn, key, local_id, status).await?;
        }
        Ok(())
    }

    /// 整体更新消息，返回是否更新了记录
    ///
    /// 服务端 ID/时间一经写入不会被覆盖。
    pub async fn update(&self, session_user_id: i64, key: ConversationKey, message: LocalMessage) -> Result<bool> {
        let Some(local_id) = message.local_id else {
            return Err(StoreError::invalid("更新消息需要 local_id"));
        };

        let mut msg = message;
        msg.local_last_modify_ms = self.deps.clock.now_ms();

        let (store, partition) = self.partition(session_user_id, key).await?;
        let table = partition.table.clone();
        let outcome = self
            .deps
            .writer
            .execute_transaction_then(
                store.im(),
                move |conn| {
                    Box::pin(async move {
                        let rows = MessageDao::update(conn, &table, local_id, &msg).await?;
                        if rows > 0 {
                            Self::reconcile_sending(conn, &key, local_id, msg.local_send_status).await?;
                        }
                        let after = MessageDao::get_by_id(conn, &table, local_id).await?;
                        Ok(ChangeOutcome { rows, after })
                    })
                },
                self.publish_changed(session_user_id, key),
            )
            .await?;

        Ok(self.finish_change(session_user_id, key, local_id, outcome, "更新"))
    }

    /// 只修改发送状态（传输层回调使用）
    pub async fn update_send_status(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        local_id: i64,
        status: SendStatus,
    ) -> Result<bool> {
        let now = self.deps.clock.now_ms();
        let (store, partition) = self.partition(session_user_id, key).await?;
        let table = partition.table.clone();
        let outcome = self
            .deps
            .writer
            .execute_transaction_then(
                store.im(),
                move |conn| {
                    Box::pin(async move {
                        let rows = MessageDao::update_send_status(conn, &table, local_id, status, now).await?;
                        if rows > 0 {
                            Self::reconcile_sending(conn, &key, local_id, status).await?;
                        }
                        let after = MessageDao::get_by_id(conn, &table, local_id).await?;
                        Ok(ChangeOutcome { rows, after })
                    })
                },
                self.publish_changed(session_user_id, key),
            )
            .await?;

        Ok(self.finish_change(session_user_id, key, local_id, outcome, "修改发送状态"))
    }

    /// 撤回：类型改为撤回并清空内容，保留 local_id、服务端 ID 和 seq
    pub async fn recall(&self, session_user_id: i64, key: ConversationKey, local_id: i64) -> Result<bool> {
        let now = self.deps.clock.now_ms();
        let (store, partition) = self.partition(session_user_id, key).await?;
        let table = partition.table.clone();
        let outcome = self
            .deps
            .writer
            .execute_transaction_then(
                store.im(),
                move |conn| {
                    Box::pin(async move {
                        let Some(mut msg) = MessageDao::get_by_id(conn, &table, local_id).await? else {
                            return Ok(ChangeOutcome { rows: 0, after: None });
                        };
                        msg.revoke();
                        msg.local_last_modify_ms = now;
                        let rows = MessageDao::update(conn, &table, local_id, &msg).await?;
                        let after = MessageDao::get_by_id(conn, &table, local_id).await?;
                        Ok(ChangeOutcome { rows, after })
                    })
                },
                self.publish_changed(session_user_id, key),
            )
            .await?;

        if outcome.rows > 0 {
            info!(
                "[MsgStore] 撤回消息: session={}, key={:?}, local_id={}",
                session_user_id, key, local_id
            );
        }
        Ok(self.finish_change(session_user_id, key, local_id, outcome, "撤回"))
    }

    /// 提交后在写队列内派发变更通知，保证与提交顺序一致
    fn publish_changed(
        &self,
        session_user_id: i64,
        key: ConversationKey,
    ) -> impl FnOnce(&ChangeOutcome) + Send + 'static {
        let bus = self.deps.bus.clone();
        move |outcome: &ChangeOutcome| {
            if let Some(after) = &outcome.after {
                bus.publish_message(MessageEvent::Changed {
                    session_user_id,
                    key,
                    message: after.clone(),
                });
            }
        }
    }

    fn finish_change(
        &self,
        session_user_id: i64,
        key: ConversationKey,
        local_id: i64,
        outcome: ChangeOutcome,
        what: &str,
    ) -> bool {
        if outcome.rows != 1 {
            error!(
                "[MsgStore] {}消息影响行数异常: session={}, key={:?}, local_id={}, rows={}",
                what, session_user_id, key, local_id, outcome.rows
            );
        }
        outcome.rows > 0
    }
}
