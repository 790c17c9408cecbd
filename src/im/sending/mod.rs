//! 待发送消息索引
//!
//! 跨会话分表记录所有未发送成功的消息，重启后无需扫描每张分表即可恢复待发送集合。

pub mod dao;
pub mod models;
pub mod service;

pub use dao::SendingDao;
pub use models::SendingEntry;
pub use service::SendingQueue;
