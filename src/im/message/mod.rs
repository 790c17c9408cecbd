//! 消息模块
//!
//! 按会话分表存储消息，写入时维护待发送索引

pub mod dao;
pub mod listener;
pub mod models;
pub mod service;

pub use dao::MessageDao;
pub use listener::{EmptyMessageListener, MessageListener};
pub use models::{LocalMessage, MediaMeta, MessageType, SendStatus};
pub use service::MessageStore;
