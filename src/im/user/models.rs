//! 用户资料本地模型

use serde::{Deserialize, Serialize};

/// 资料字段，整体序列化进 `user_info.payload`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub nickname: String,
    pub avatar: String,
    pub gold: bool,
    pub verified: bool,
    pub gender: i32,
    /// 业务自定义数据，原样保存
    pub custom: String,
}

/// 缓存的对端用户资料
///
/// `update_time_ms` 是服务端版本，为 0 表示只占位、尚未收到过资料。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: i64,
    #[serde(rename = "updateTimeMs")]
    pub update_time_ms: i64,
    #[serde(rename = "localLastModifyMs")]
    pub local_last_modify_ms: i64,
    #[serde(flatten)]
    pub profile: UserProfile,
}

impl UserInfo {
    pub fn new(uid: i64, update_time_ms: i64, profile: UserProfile) -> Self {
        Self {
            uid,
            update_time_ms,
            local_last_modify_ms: 0,
            profile,
        }
    }

    /// 是否收到过完整资料
    pub fn is_received(&self) -> bool {
        self.update_time_ms > 0
    }
}

/// 资料同步记录，独立于资料本身，未收到资料前也能记录"已经请求过"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoSync {
    pub uid: i64,
    #[serde(rename = "localLastSyncTimeMs")]
    pub local_last_sync_time_ms: i64,
}

/// 用户资料缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserCacheKey {
    pub session_user_id: i64,
    pub uid: i64,
}
