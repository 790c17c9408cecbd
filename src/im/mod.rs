pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod conversation;
pub mod db;
pub mod error;
pub mod message;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod sending;
pub mod sequence;
pub mod types;
pub mod user;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出上下文与配置
pub use config::{StoreConfig, SyncPolicy};
pub use context::StoreContext;
pub use error::{Result, StoreError};
