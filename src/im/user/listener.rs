//! 用户资料监听器回调接口

use async_trait::async_trait;

/// 用户资料监听器
///
/// 只携带 uid，监听方自行重新读取。
#[async_trait]
pub trait UserInfoListener: Send + Sync {
    async fn on_user_info_changed(&self, session_user_id: i64, uid: i64);
}

/// 空实现（默认监听器）
pub struct EmptyUserInfoListener;

#[async_trait]
impl UserInfoListener for EmptyUserInfoListener {
    async fn on_user_info_changed(&self, _session_user_id: i64, _uid: i64) {}
}
