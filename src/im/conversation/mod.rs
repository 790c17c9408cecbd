//! 会话模块
//!
//! 会话的增删改查与分页，带有界缓存

pub mod dao;
pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型
pub use dao::ConversationDao;
pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationFlags, LocalConversation};
pub use service::{ConversationCacheKey, ConversationStore};
