//! 串行任务队列
//!
//! 按键划分的深度为 1 的队列：同一键同一时刻只有一个任务在执行，
//! 不同键之间互不阻塞。写事务按数据库句柄排队，资料同步按会话用户排队。

use crate::im::error::{Result, StoreError};
use crate::im::registry::{DbHandle, StoreKey};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};

/// 按键串行执行的任务队列
pub struct SerialQueue<K> {
    name: &'static str,
    gates: Mutex<HashMap<K, Arc<Semaphore>>>,
}

impl<K> SerialQueue<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// 锁只保护队列的创建，不覆盖任务执行
    fn gate(&self, key: &K) -> Arc<Semaphore> {
        let mut gates = self.gates.lock();
        gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// 排队执行任务
    ///
    /// 按提交顺序获取许可（tokio 信号量是公平的），拿到许可后在独立任务中执行，
    /// 一旦出队就会执行到结束，调用方被取消也不会中断。
    pub async fn run<F, T>(&self, key: K, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .gate(&key)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Task(format!("{} 队列已关闭: {:?}", self.name, key)))?;

        debug!("[{}] 任务出队: {:?}", self.name, key);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            job.await
        });
        handle.await?
    }

    /// 移除某个键的队列（会话关闭时调用）
    pub fn forget(&self, key: &K) {
        self.gates.lock().remove(key);
    }
}

/// 写事务队列：每个数据库句柄同一时刻最多一个写事务
pub struct WriteQueue {
    queue: SerialQueue<StoreKey>,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            queue: SerialQueue::new("WriteQueue"),
        }
    }

    /// 在串行队列中执行一个事务
    ///
    /// `work` 返回 `Ok` 时提交，返回 `Err` 时回滚，错误记录日志后原样返回。
    pub async fn execute_transaction<T, F>(&self, db: &DbHandle, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        self.execute_transaction_then(db, work, |_: &T| {}).await
    }

    /// 同 [`WriteQueue::execute_transaction`]，提交成功后在队列内调用 `on_commit`
    ///
    /// `on_commit` 在释放队列之前执行，同一数据库上的提交与回调顺序一致。
    /// 回滚时不调用。
    pub async fn execute_transaction_then<T, F, H>(&self, db: &DbHandle, work: F, on_commit: H) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
        H: FnOnce(&T) + Send + 'static,
    {
        let pool = db.pool().clone();
        let key = db.key().clone();
        let log_key = key.clone();
        let result = self
            .queue
            .run(key, async move {
                let mut tx = pool.begin().await?;
                match work(&mut *tx).await {
                    Ok(value) => {
                        tx.commit().await?;
                        on_commit(&value);
                        Ok(value)
                    }
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            error!("[WriteQueue] 事务回滚失败: {}", rollback_err);
                        }
                        Err(e)
                    }
                }
            })
            .await;

        if let Err(ref e) = result {
            error!("[WriteQueue] 事务执行失败 {:?}: {}", log_key, e);
        }
        result
    }

    pub fn forget(&self, key: &StoreKey) {
        self.queue.forget(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::registry::StoreRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_never_overlaps() {
        let queue = Arc::new(SerialQueue::<u32>::new("Test"));
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(7, async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_keys_run_concurrently() {
        let queue = Arc::new(SerialQueue::<u32>::new("Test"));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut handles = Vec::new();
        for key in [1u32, 2u32] {
            let queue = queue.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(key, async move {
                        // 两个键都进入后才能通过，串行执行会卡住
                        barrier.wait().await;
                        Ok(key)
                    })
                    .await
            }));
        }
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            let mut out = Vec::new();
            for h in handles {
                out.push(h.await.unwrap().unwrap());
            }
            out
        })
        .await
        .expect("不同键的任务应当并发执行");
        assert_eq!(joined.len(), 2);
    }

    #[tokio::test]
    async fn job_error_is_returned() {
        let queue = SerialQueue::<u32>::new("Test");
        let res: Result<()> = queue
            .run(1, async { Err(StoreError::invalid("boom")) })
            .await;
        assert!(matches!(res, Err(StoreError::InvalidArgument(_))));

        // 失败不影响后续任务
        let ok = queue.run(1, async { Ok(5) }).await.unwrap();
        assert_eq!(ok, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn commit_hook_runs_before_next_transaction() {
        crate::im::testing::init_test_logger();
        let registry = StoreRegistry::new(Arc::new(crate::im::testing::temp_config()));
        let store = registry.get_store(1).await.unwrap();
        let writer = Arc::new(WriteQueue::new());
        let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..8u32 {
            let writer = writer.clone();
            let store = store.clone();
            let work_trace = trace.clone();
            let hook_trace = trace.clone();
            handles.push(tokio::spawn(async move {
                writer
                    .execute_transaction_then(
                        store.im(),
                        move |_conn| {
                            Box::pin(async move {
                                work_trace.lock().push(("work", n));
                                Ok(n)
                            })
                        },
                        move |v: &u32| hook_trace.lock().push(("commit", *v)),
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // 每次提交回调都紧跟自己的事务，中间不会插入别的事务
        let trace = trace.lock().clone();
        assert_eq!(trace.len(), 16);
        for pair in trace.chunks(2) {
            assert_eq!(pair[0].0, "work");
            assert_eq!(pair[1], ("commit", pair[0].1));
        }
    }

    #[tokio::test]
    async fn commit_hook_skipped_on_rollback() {
        let registry = StoreRegistry::new(Arc::new(crate::im::testing::temp_config()));
        let store = registry.get_store(1).await.unwrap();
        let writer = WriteQueue::new();
        let called = Arc::new(AtomicUsize::new(0));

        let hook_called = called.clone();
        let res: Result<()> = writer
            .execute_transaction_then(
                store.im(),
                |_conn| Box::pin(async { Err(StoreError::invalid("rollback")) }),
                move |_: &()| {
                    hook_called.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
        assert!(res.is_err());
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
