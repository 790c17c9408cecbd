//! 用户资料模块
//!
//! 资料缓存（带有界内存缓存）与资料同步调度

pub mod dao;
pub mod listener;
pub mod models;
pub mod service;
pub mod sync;

pub use dao::{UserInfoDao, UserInfoSyncDao};
pub use listener::{EmptyUserInfoListener, UserInfoListener};
pub use models::{UserCacheKey, UserInfo, UserInfoSync, UserProfile};
pub use service::UserInfoStore;
pub use sync::{
    BatchOutcome, SyncOutcome, SyncReason, SyncTransport, UserInfoFetchRequest, UserInfoSyncer,
};
