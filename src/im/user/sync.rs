//! 用户资料同步调度
//!
//! 决定何时向服务端请求资料，真正的收发由外部传输层完成，
//! 收到的资料再经 [`UserInfoStore::insert_or_update`] 写回。
//!
//! 同一会话用户的同步决策在一个串行队列里执行。批量同步每次最多发出
//! `max_batch` 个用户，剩余部分作为新任务重新排队。

use crate::im::clock::duration_ms;
use crate::im::config::SyncPolicy;
use crate::im::context::StoreDeps;
use crate::im::error::Result;
use crate::im::queue::SerialQueue;
use crate::im::user::dao::UserInfoSyncDao;
use crate::im::user::models::UserInfo;
use crate::im::user::service::UserInfoStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 单个用户的资料请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserInfoFetchRequest {
    pub uid: i64,
    #[serde(rename = "lastKnownUpdateTimeSeconds")]
    pub last_known_update_time_secs: i64,
}

/// 传输层（外部协作方）
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// 当前是否在线
    fn is_online(&self) -> bool;

    async fn fetch_user_info(&self, request: UserInfoFetchRequest) -> anyhow::Result<()>;

    async fn fetch_user_info_batch(&self, requests: Vec<UserInfoFetchRequest>) -> anyhow::Result<()>;
}

/// 需要同步的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    /// 调用方强制
    Force,
    /// 从未同步过
    FirstTime,
    /// 距上次同步超过过期时长
    Stale,
    /// 服务端提示有更新的版本
    ServerHint,
    /// 从未收到资料，且距上次尝试已过重试间隔
    EmptyProfileRetry,
}

/// 单用户同步结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Sent(SyncReason),
    NotNeeded,
    /// 传输层不存在或离线，本轮放弃，不记录
    Offline,
    /// 发送失败
    Failed,
}

/// 批量同步第一轮的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// 本轮发出的请求项数
    pub sent: usize,
    /// 检查后无需同步的用户数
    pub skipped: usize,
    /// 未检查、重新排队的用户数
    pub requeued: usize,
    pub offline: bool,
}

struct SyncerInner {
    deps: StoreDeps,
    users: Arc<UserInfoStore>,
    policy: SyncPolicy,
    transport: RwLock<Option<Arc<dyn SyncTransport>>>,
    queue: SerialQueue<i64>,
}

/// 用户资料同步器
#[derive(Clone)]
pub struct UserInfoSyncer {
    inner: Arc<SyncerInner>,
}

impl UserInfoSyncer {
    pub(crate) fn new(deps: StoreDeps, users: Arc<UserInfoStore>, policy: SyncPolicy) -> Self {
        Self {
            inner: Arc::new(SyncerInner {
                deps,
                users,
                policy,
                transport: RwLock::new(None),
                queue: SerialQueue::new("UserSync"),
            }),
        }
    }

    /// 挂载或卸下传输层
    pub fn set_transport(&self, transport: Option<Arc<dyn SyncTransport>>) {
        info!("[UserSync] 传输层{}", if transport.is_some() { "已挂载" } else { "已卸下" });
        *self.inner.transport.write() = transport;
    }

    /// 判断是否需要同步（不排队，不产生副作用）
    pub async fn should_sync(
        &self,
        session_user_id: i64,
        uid: i64,
        server_hint_update_time_ms: i64,
        force: bool,
    ) -> Result<Option<SyncReason>> {
        self.inner
            .should_sync(session_user_id, uid, server_hint_update_time_ms, force)
            .await
    }

    /// 同步单个用户资料
    pub async fn sync_user_info(
        &self,
        session_user_id: i64,
        uid: i64,
        server_hint_update_time_ms: i64,
        force: bool,
    ) -> Result<SyncOutcome> {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(session_user_id, async move {
                inner
                    .sync_one(session_user_id, uid, server_hint_update_time_ms, force)
                    .await
            })
            .await
    }

    /// 批量同步，返回第一轮的结果；超出单批上限的部分在后台继续
    pub async fn sync_user_info_batch(&self, session_user_id: i64, uids: Vec<i64>) -> Result<BatchOutcome> {
        let inner = self.inner.clone();
        self.inner
            .queue
            .run(session_user_id, async move {
                inner.batch_pass(session_user_id, uids).await
            })
            .await
    }

    pub(crate) fn forget(&self, session_user_id: i64) {
        self.inner.queue.forget(&session_user_id);
    }
}

impl SyncerInner {
    fn online_transport(&self) -> Option<Arc<dyn SyncTransport>> {
        self.transport
            .read()
            .clone()
            .filter(|transport| transport.is_online())
    }

    async fn should_sync(
        &self,
        session_user_id: i64,
        uid: i64,
        server_hint_update_time_ms: i64,
        force: bool,
    ) -> Result<Option<SyncReason>> {
        if force {
            return Ok(Some(SyncReason::Force));
        }

        let store = self.deps.registry.get_store(session_user_id).await?;
        let last_sync = {
            let mut conn = store.user().pool().acquire().await?;
            UserInfoSyncDao::get(&mut conn, uid).await?
        };
        let Some(last_sync) = last_sync else {
            return Ok(Some(SyncReason::FirstTime));
        };

        let elapsed = self.deps.clock.now_ms() - last_sync.local_last_sync_time_ms;
        if elapsed >= duration_ms(self.policy.stale_after) {
            return Ok(Some(SyncReason::Stale));
        }

        let local_update = self
            .users
            .get_by_user_id(session_user_id, uid)
            .await?
            .map_or(0, |info| info.update_time_ms);
        if server_hint_update_time_ms > local_update {
            return Ok(Some(SyncReason::ServerHint));
        }
        if local_update == 0 && elapsed >= duration_ms(self.policy.empty_profile_retry) {
            return Ok(Some(SyncReason::EmptyProfileRetry));
        }
        Ok(None)
    }

    async fn record_sync(&self, session_user_id: i64, uids: Vec<i64>) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let now = self.deps.clock.now_ms();
        let store = self.deps.registry.get_store(session_user_id).await?;
        self.deps
            .writer
            .execute_transaction(store.user(), move |conn| {
                Box::pin(async move {
                    for uid in uids {
                        UserInfoSyncDao::record(conn, uid, now).await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    async fn sync_one(
        &self,
        session_user_id: i64,
        uid: i64,
        server_hint_update_time_ms: i64,
        force: bool,
    ) -> Result<SyncOutcome> {
        let Some(transport) = self.online_transport() else {
            debug!("[UserSync] 传输层不可用，放弃同步: uid={}", uid);
            return Ok(SyncOutcome::Offline);
        };
        let Some(reason) = self
            .should_sync(session_user_id, uid, server_hint_update_time_ms, force)
            .await?
        else {
            return Ok(SyncOutcome::NotNeeded);
        };

        let cached = self.users.get_by_user_id(session_user_id, uid).await?;
        let received = cached.as_ref().is_some_and(UserInfo::is_received);
        // 从未收到资料的用户先记录再发送，进程中途退出也不会立即重试
        if !received {
            self.record_sync(session_user_id, vec![uid]).await?;
        }

        let request = fetch_request(uid, cached.as_ref());
        match transport.fetch_user_info(request).await {
            Ok(()) => {
                if received {
                    self.record_sync(session_user_id, vec![uid]).await?;
                }
                debug!("[UserSync] 已请求资料: uid={}, reason={:?}", uid, reason);
                Ok(SyncOutcome::Sent(reason))
            }
            Err(e) => {
                warn!("[UserSync] 请求资料失败: uid={}, err={:#}", uid, e);
                Ok(SyncOutcome::Failed)
            }
        }
    }

    async fn batch_pass(self: Arc<Self>, session_user_id: i64, uids: Vec<i64>) -> Result<BatchOutcome> {
        let Some(transport) = self.online_transport() else {
            debug!("[UserSync] 传输层不可用，放弃批量同步: {} 个用户", uids.len());
            return Ok(BatchOutcome {
                offline: true,
                ..BatchOutcome::default()
            });
        };

        let mut seen = HashSet::new();
        let unique: Vec<i64> = uids
            .into_iter()
            .filter(|uid| *uid > 0 && seen.insert(*uid))
            .collect();

        let max_batch = self.policy.max_batch.max(1);
        let mut selected = Vec::new();
        let mut skipped = 0;
        let mut examined = 0;
        for uid in &unique {
            if selected.len() >= max_batch {
                break;
            }
            examined += 1;
            match self.should_sync(session_user_id, *uid, 0, false).await? {
                Some(_) => selected.push(*uid),
                None => skipped += 1,
            }
        }
        let remainder: Vec<i64> = unique[examined..].to_vec();

        let mut outcome = BatchOutcome {
            sent: 0,
            skipped,
            requeued: remainder.len(),
            offline: false,
        };

        if !selected.is_empty() {
            let cached: HashMap<i64, UserInfo> = self
                .users
                .get_by_user_id_batch(session_user_id, &selected)
                .await?
                .into_iter()
                .map(|info| (info.uid, info))
                .collect();

            let (fresh, known): (Vec<i64>, Vec<i64>) = selected
                .iter()
                .copied()
                .partition(|uid| !cached.get(uid).is_some_and(UserInfo::is_received));
            self.record_sync(session_user_id, fresh).await?;

            let requests: Vec<UserInfoFetchRequest> = selected
                .iter()
                .map(|uid| fetch_request(*uid, cached.get(uid)))
                .collect();
            match transport.fetch_user_info_batch(requests).await {
                Ok(()) => {
                    self.record_sync(session_user_id, known).await?;
                    outcome.sent = selected.len();
                }
                Err(e) => {
                    warn!(
                        "[UserSync] 批量请求资料失败: {} 个用户, err={:#}",
                        selected.len(),
                        e
                    );
                }
            }
        }

        info!(
            "[UserSync] 批量同步: session={}, 发出 {}, 跳过 {}, 重新排队 {}",
            session_user_id, outcome.sent, outcome.skipped, outcome.requeued
        );
        if !remainder.is_empty() {
            requeue(self.clone(), session_user_id, remainder);
        }
        Ok(outcome)
    }
}

fn fetch_request(uid: i64, cached: Option<&UserInfo>) -> UserInfoFetchRequest {
    UserInfoFetchRequest {
        uid,
        last_known_update_time_secs: cached.map_or(0, |info| info.update_time_ms / 1000),
    }
}

/// 剩余用户作为新任务排到同一会话的队列末尾
fn requeue(inner: Arc<SyncerInner>, session_user_id: i64, uids: Vec<i64>) {
    tokio::spawn(async move {
        let job = inner.clone();
        let res = inner
            .queue
            .run(session_user_id, async move { job.batch_pass(session_user_id, uids).await })
            .await;
        if let Err(e) = res {
            warn!("[UserSync] 重新排队的批量同步失败: {}", e);
        }
    });
}
