//! 测试辅助：日志、临时目录、手动时钟、记录型传输层

use crate::im::clock::{duration_ms, Clock};
use crate::im::config::StoreConfig;
use crate::im::context::StoreContext;
use crate::im::user::sync::{SyncTransport, UserInfoFetchRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// 每个测试一个独立的数据目录
pub(crate) fn temp_config() -> StoreConfig {
    let dir = std::env::temp_dir().join(format!("im-sdk-core-test-{}", uuid::Uuid::new_v4()));
    StoreConfig::new(dir)
}

/// 手动推进的时钟
pub(crate) struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub(crate) fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(start_ms),
        })
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(duration_ms(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// 2024-01-01T00:00:00Z
const TEST_EPOCH_MS: i64 = 1_704_067_200_000;

/// 临时目录 + 手动时钟的上下文
pub(crate) fn test_context() -> (StoreContext, Arc<ManualClock>) {
    init_test_logger();
    let clock = ManualClock::new(TEST_EPOCH_MS);
    let ctx = StoreContext::with_clock(temp_config(), clock.clone());
    (ctx, clock)
}

/// 记录所有请求的传输层
pub(crate) struct RecordingTransport {
    online: AtomicBool,
    failing: AtomicBool,
    singles: Mutex<Vec<UserInfoFetchRequest>>,
    batches: Mutex<Vec<Vec<UserInfoFetchRequest>>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            singles: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn single_requests(&self) -> Vec<UserInfoFetchRequest> {
        self.singles.lock().clone()
    }

    pub(crate) fn batches(&self) -> Vec<Vec<UserInfoFetchRequest>> {
        self.batches.lock().clone()
    }

    /// 等待收到至少 `n` 个批量请求，超时则返回当前已有的
    pub(crate) async fn wait_for_batches(&self, n: usize, timeout: Duration) -> Vec<Vec<UserInfoFetchRequest>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let batches = self.batches();
            if batches.len() >= n || tokio::time::Instant::now() >= deadline {
                return batches;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn fetch_user_info(&self, request: UserInfoFetchRequest) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("模拟发送失败");
        }
        self.singles.lock().push(request);
        Ok(())
    }

    async fn fetch_user_info_batch(&self, requests: Vec<UserInfoFetchRequest>) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("模拟发送失败");
        }
        self.batches.lock().push(requests);
        Ok(())
    }
}
